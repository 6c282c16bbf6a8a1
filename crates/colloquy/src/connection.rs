//! Wire-level connection: message multiplexing and per-call lifecycle.
//!
//! An envelope is the four-element array `[namespace, name, id, payload]`,
//! encoded with the connection's serializer (msgpack unless negotiated
//! otherwise). The reader task dispatches incoming envelopes by namespace:
//! `rpc` traffic correlates against the pending/active call tables, `events`
//! fans out to subscriptions, `connection` handles keepalive and shutdown,
//! and `discover` answers introspection from the attached context.
//!
//! The writer is serialized behind one async mutex, which is what gives
//! events and responses their total per-direction ordering.

use std::collections::{HashMap, VecDeque};
use std::os::fd::OwnedFd;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::call::{Call, CallInner, CallStatus, ServerCallContext};
use crate::context::{Context, DEFAULT_INTERFACE, MethodAddress, ROOT_PATH};
use crate::error::{ErrorKind, Result, RpcError};
use crate::object::{Object, Tag};
use crate::pack::{PackArg, pack};
use crate::serializer::{self, Serializer};
use crate::transport::{PeerCred, Transport, WireFrame};

pub(crate) const NS_RPC: &str = "rpc";
pub(crate) const NS_EVENTS: &str = "events";
pub(crate) const NS_CONNECTION: &str = "connection";
pub(crate) const NS_DISCOVER: &str = "discover";

/// Serializer used when the caller does not pick one.
pub const DEFAULT_SERIALIZER: &str = "msgpack";

/// Envelope id used for fire-and-forget traffic; never correlated.
const NO_REPLY_ID: u64 = 0;

/// Callback invoked for events matching a subscription.
pub type EventHandlerFn = Arc<dyn Fn(&str, &str, &str, Object) + Send + Sync>;

#[derive(Clone)]
struct EventSubscription {
    path: Option<String>,
    interface: Option<String>,
    name: Option<String>,
    handler: EventHandlerFn,
}

#[derive(Clone, PartialEq, Eq)]
struct PatternTriple {
    path: Option<String>,
    interface: Option<String>,
    name: Option<String>,
}

/// A `None` pattern matches everything; otherwise glob semantics, falling
/// back to literal comparison for invalid patterns.
fn pattern_matches(pattern: Option<&str>, value: &str) -> bool {
    match pattern {
        None => true,
        Some(pattern) => glob::Pattern::new(pattern)
            .map(|p| p.matches(value))
            .unwrap_or(pattern == value),
    }
}

impl PatternTriple {
    fn matches(&self, path: &str, interface: &str, name: &str) -> bool {
        pattern_matches(self.path.as_deref(), path)
            && pattern_matches(self.interface.as_deref(), interface)
            && pattern_matches(self.name.as_deref(), name)
    }
}

pub(crate) struct ConnectionInner {
    transport: Transport,
    serializer: Arc<dyn Serializer>,
    serializer_name: String,
    context: Option<Context>,
    next_id: AtomicU64,
    pending: SyncMutex<HashMap<u64, Arc<CallInner>>>,
    active: SyncMutex<HashMap<u64, ServerCallContext>>,
    writer: Mutex<()>,
    closed: AtomicBool,
    closed_notify: Notify,
    event_handlers: SyncMutex<Vec<EventSubscription>>,
    peer_subscriptions: SyncMutex<Vec<PatternTriple>>,
    pong_waiters: SyncMutex<VecDeque<oneshot::Sender<()>>>,
    reader: SyncMutex<Option<JoinHandle<()>>>,
}

impl ConnectionInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Serialize and write one envelope, collecting descriptor attachments
    /// from the payload.
    pub(crate) async fn send_envelope(
        &self,
        namespace: &str,
        name: &str,
        id: u64,
        payload: Option<Object>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::transport_closed("connection is closed"));
        }

        let payload = payload.unwrap_or_else(Object::null);

        let mut fds: Vec<OwnedFd> = Vec::new();
        payload.collect_attachments(&mut fds)?;
        if !fds.is_empty() && !self.transport.supports_fd_passing() {
            return Err(RpcError::unsupported_by_transport(format!(
                "{} frames cannot carry descriptors",
                self.transport.peer_label()
            )));
        }

        let envelope = Object::array(vec![
            Object::string(namespace),
            Object::string(name),
            Object::uint64(id),
            payload,
        ]);
        let body = self.serializer.dump(&envelope)?;

        let _guard = self.writer.lock().await;
        self.transport
            .send(WireFrame {
                body: body.into(),
                fds,
            })
            .await
    }

    pub(crate) fn forget_call(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    /// Tear the connection down: fail every pending call, cancel every
    /// active handler, wake every waiter. Idempotent.
    pub(crate) fn shutdown(&self, err: RpcError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(error = %err, "connection shutting down");
        self.transport.close();

        let pending: Vec<Arc<CallInner>> =
            self.pending.lock().drain().map(|(_, call)| call).collect();
        for call in pending {
            call.fail(err.clone());
        }

        let active: Vec<ServerCallContext> =
            self.active.lock().drain().map(|(_, cx)| cx).collect();
        for cx in active {
            cx.cancel();
        }

        self.pong_waiters.lock().clear();
        self.closed_notify.notify_waiters();
    }

    pub(crate) fn peer_subscribed(&self, path: &str, interface: &str, name: &str) -> bool {
        self.peer_subscriptions
            .lock()
            .iter()
            .any(|t| t.matches(path, interface, name))
    }
}

/// A live connection over one transport endpoint.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap a connected transport. With a [`Context`] attached, incoming
    /// calls are dispatched; without one, every incoming call fails
    /// `not-found`.
    pub fn new(
        transport: Transport,
        context: Option<Context>,
        serializer: Option<&str>,
    ) -> Result<Connection> {
        let serializer_name = serializer.unwrap_or(DEFAULT_SERIALIZER);
        let serializer = serializer::find(serializer_name)?;

        let inner = Arc::new(ConnectionInner {
            transport,
            serializer,
            serializer_name: serializer_name.to_owned(),
            context,
            next_id: AtomicU64::new(1),
            pending: SyncMutex::new(HashMap::new()),
            active: SyncMutex::new(HashMap::new()),
            writer: Mutex::new(()),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            event_handlers: SyncMutex::new(Vec::new()),
            peer_subscriptions: SyncMutex::new(Vec::new()),
            pong_waiters: SyncMutex::new(VecDeque::new()),
            reader: SyncMutex::new(None),
        });

        let reader_inner = inner.clone();
        let handle = tokio::spawn(async move { reader_loop(reader_inner).await });
        *inner.reader.lock() = Some(handle);

        Ok(Connection { inner })
    }

    pub(crate) fn ptr_eq(a: &Connection, b: &Connection) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Whether the peer has subscribed to events matching this triple.
    pub(crate) fn peer_subscribed_to(&self, path: &str, interface: &str, name: &str) -> bool {
        self.inner.peer_subscribed(path, interface, name)
    }

    pub fn serializer_name(&self) -> &str {
        &self.inner.serializer_name
    }

    /// Human-readable description of the remote endpoint.
    pub fn remote_address(&self) -> String {
        self.inner.transport.peer_label()
    }

    /// Transport-level credentials of the peer, when available.
    pub fn peer_cred(&self) -> Option<PeerCred> {
        self.inner.transport.peer_cred()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Block until the connection has shut down.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.inner.closed_notify.notified();
            if self.inner.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Gracefully shut down: tell the peer, fail pending calls, stop the
    /// reader.
    pub async fn close(&self) {
        if self.inner.is_closed() {
            return;
        }
        // Farewell is best-effort; a jammed peer must not stall shutdown.
        let _ = tokio::time::timeout(
            Duration::from_millis(250),
            self.inner
                .send_envelope(NS_CONNECTION, "close", NO_REPLY_ID, None),
        )
        .await;
        self.inner
            .shutdown(RpcError::transport_closed("connection closed locally"));
        let handle = self.inner.reader.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Invoke `method` on the peer, returning the call handle immediately.
    pub async fn call(
        &self,
        path: Option<&str>,
        interface: Option<&str>,
        method: &str,
        args: Object,
    ) -> Result<Call> {
        let address = MethodAddress {
            path: path.unwrap_or(ROOT_PATH).to_owned(),
            interface: interface.unwrap_or(DEFAULT_INTERFACE).to_owned(),
            method: method.to_owned(),
        };
        let payload = Object::dict_from([
            ("path", Object::string(&address.path)),
            ("interface", Object::string(&address.interface)),
            ("method", Object::string(&address.method)),
            ("args", args),
        ]);
        self.start_call(NS_RPC, "call", address, payload).await
    }

    async fn start_call(
        &self,
        namespace: &str,
        name: &str,
        address: MethodAddress,
        payload: Object,
    ) -> Result<Call> {
        if self.inner.is_closed() {
            return Err(RpcError::transport_closed("connection is closed"));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let call_inner = CallInner::new(id, address, Arc::downgrade(&self.inner));
        self.inner.pending.lock().insert(id, call_inner.clone());

        match self
            .inner
            .send_envelope(namespace, name, id, Some(payload))
            .await
        {
            Ok(()) => Ok(Call { inner: call_inner }),
            Err(err) => {
                self.inner.pending.lock().remove(&id);
                Err(err)
            }
        }
    }

    /// Pack arguments, invoke `method` on the default interface, wait for
    /// the outcome and return the first result.
    pub async fn call_simple(
        &self,
        method: &str,
        fmt: Option<&str>,
        args: Vec<PackArg>,
    ) -> Result<Object> {
        let args = match fmt {
            Some(fmt) => pack(fmt, args)?,
            None => Object::array(Vec::new()),
        };
        let call = self.call(None, None, method, args).await?;
        match call.wait().await {
            CallStatus::Done | CallStatus::StreamStart | CallStatus::MoreAvailable => {
                Ok(call.result().unwrap_or_else(Object::null))
            }
            CallStatus::Ended => Ok(Object::null()),
            CallStatus::Error => {
                let error = call.result().unwrap_or_else(Object::null);
                Err(error
                    .to_rpc_error()
                    .unwrap_or_else(|_| RpcError::internal("peer sent a malformed error")))
            }
            CallStatus::Aborted => Err(RpcError::aborted("call was aborted")),
            CallStatus::InProgress => Err(RpcError::internal("wait returned without transition")),
        }
    }

    /// Fire-and-forget invocation: no id, no reply, no call handle.
    pub async fn call_no_reply(
        &self,
        path: Option<&str>,
        interface: Option<&str>,
        method: &str,
        args: Object,
    ) -> Result<()> {
        let payload = Object::dict_from([
            ("path", Object::string(path.unwrap_or(ROOT_PATH))),
            (
                "interface",
                Object::string(interface.unwrap_or(DEFAULT_INTERFACE)),
            ),
            ("method", Object::string(method)),
            ("args", args),
        ]);
        self.inner
            .send_envelope(NS_RPC, "call", NO_REPLY_ID, Some(payload))
            .await
    }

    /// Register a handler for events matching the given patterns (`None`
    /// matches all) and subscribe with the peer.
    pub async fn register_event_handler(
        &self,
        path: Option<&str>,
        interface: Option<&str>,
        name: Option<&str>,
        handler: EventHandlerFn,
    ) -> Result<()> {
        self.inner.event_handlers.lock().push(EventSubscription {
            path: path.map(str::to_owned),
            interface: interface.map(str::to_owned),
            name: name.map(str::to_owned),
            handler,
        });
        self.subscribe(path, interface, name).await
    }

    pub async fn subscribe(
        &self,
        path: Option<&str>,
        interface: Option<&str>,
        name: Option<&str>,
    ) -> Result<()> {
        let payload = subscription_payload(path, interface, name);
        self.inner
            .send_envelope(NS_EVENTS, "subscribe", NO_REPLY_ID, Some(payload))
            .await
    }

    /// Drop local handlers registered for exactly this pattern triple and
    /// tell the peer.
    pub async fn unsubscribe(
        &self,
        path: Option<&str>,
        interface: Option<&str>,
        name: Option<&str>,
    ) -> Result<()> {
        self.inner.event_handlers.lock().retain(|sub| {
            !(sub.path.as_deref() == path
                && sub.interface.as_deref() == interface
                && sub.name.as_deref() == name)
        });
        let payload = subscription_payload(path, interface, name);
        self.inner
            .send_envelope(NS_EVENTS, "unsubscribe", NO_REPLY_ID, Some(payload))
            .await
    }

    /// Emit one event to the peer. Delivery is best-effort.
    pub async fn emit_event(
        &self,
        path: Option<&str>,
        interface: Option<&str>,
        name: &str,
        args: Object,
    ) -> Result<()> {
        let payload = Object::dict_from([
            ("path", Object::string(path.unwrap_or(ROOT_PATH))),
            (
                "interface",
                Object::string(interface.unwrap_or(DEFAULT_INTERFACE)),
            ),
            ("name", Object::string(name)),
            ("args", args),
        ]);
        self.inner
            .send_envelope(NS_EVENTS, "event", NO_REPLY_ID, Some(payload))
            .await
    }

    /// Keepalive probe: true when the peer answers within `deadline`.
    pub async fn ping(&self, deadline: Duration) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.inner.pong_waiters.lock().push_back(tx);
        self.inner
            .send_envelope(NS_CONNECTION, "ping", NO_REPLY_ID, None)
            .await?;
        Ok(matches!(
            tokio::time::timeout(deadline, rx).await,
            Ok(Ok(()))
        ))
    }

    /// Introspection: every instance the peer exposes.
    pub async fn get_instances(&self) -> Result<Object> {
        let address = discover_address("get_instances");
        let call = self
            .start_call(NS_DISCOVER, "get_instances", address, Object::null())
            .await?;
        wait_single_result(&call).await
    }

    /// Introspection: interface names of one instance.
    pub async fn get_interfaces(&self, path: &str) -> Result<Object> {
        let address = discover_address("get_interfaces");
        let payload = Object::dict_from([("path", Object::string(path))]);
        let call = self
            .start_call(NS_DISCOVER, "get_interfaces", address, payload)
            .await?;
        wait_single_result(&call).await
    }

    /// Introspection: `{name, description, interface}` for each method.
    pub async fn get_methods(
        &self,
        path: Option<&str>,
        interface: Option<&str>,
    ) -> Result<Object> {
        let address = discover_address("get_methods");
        let payload = Object::dict_from([
            ("path", Object::string(path.unwrap_or(ROOT_PATH))),
            (
                "interface",
                interface.map(Object::string).unwrap_or_else(Object::null),
            ),
        ]);
        let call = self
            .start_call(NS_DISCOVER, "get_methods", address, payload)
            .await?;
        wait_single_result(&call).await
    }
}

fn discover_address(method: &str) -> MethodAddress {
    MethodAddress {
        path: ROOT_PATH.to_owned(),
        interface: NS_DISCOVER.to_owned(),
        method: method.to_owned(),
    }
}

async fn wait_single_result(call: &Call) -> Result<Object> {
    match call.wait().await {
        CallStatus::Done => Ok(call.result().unwrap_or_else(Object::null)),
        CallStatus::Error => {
            let error = call.result().unwrap_or_else(Object::null);
            Err(error
                .to_rpc_error()
                .unwrap_or_else(|_| RpcError::internal("peer sent a malformed error")))
        }
        other => Err(RpcError::internal(format!(
            "unexpected call status {:?}",
            other
        ))),
    }
}

fn subscription_payload(
    path: Option<&str>,
    interface: Option<&str>,
    name: Option<&str>,
) -> Object {
    Object::dict_from([
        ("path", path.map(Object::string).unwrap_or_else(Object::null)),
        (
            "interface",
            interface.map(Object::string).unwrap_or_else(Object::null),
        ),
        ("name", name.map(Object::string).unwrap_or_else(Object::null)),
    ])
}

fn optional_str(payload: &Object, key: &str) -> Option<String> {
    payload
        .get_key(key)
        .and_then(|v| v.as_str().ok().map(str::to_owned))
}

async fn reader_loop(inner: Arc<ConnectionInner>) {
    loop {
        if inner.is_closed() {
            break;
        }
        let frame = match inner.transport.recv().await {
            Ok(frame) => frame,
            Err(err) => {
                inner.shutdown(err);
                break;
            }
        };
        if let Err(err) = dispatch_frame(&inner, frame).await {
            warn!(error = %err, "dropping malformed frame");
        }
    }
}

async fn dispatch_frame(inner: &Arc<ConnectionInner>, frame: WireFrame) -> Result<()> {
    let envelope = inner.serializer.load(&frame.body)?;
    if envelope.tag() != Tag::Array || envelope.len()? != 4 {
        return Err(RpcError::invalid_arguments(
            "envelope is not a four-element array",
        ));
    }

    let field = |idx: usize| envelope.get_index(idx).unwrap_or_else(Object::null);
    let namespace = field(0).as_str()?.to_owned();
    let name = field(1).as_str()?.to_owned();
    let id = field(2).as_u64()?;
    let mut payload = field(3);

    if !frame.fds.is_empty() {
        let mut slots: Vec<Option<OwnedFd>> = frame.fds.into_iter().map(Some).collect();
        payload = payload.resolve_attachments(&mut slots)?;
    }

    trace!(namespace = %namespace, name = %name, id, "frame in");

    match namespace.as_str() {
        NS_RPC => handle_rpc(inner, &name, id, payload).await,
        NS_EVENTS => {
            handle_events(inner, &name, payload);
            Ok(())
        }
        NS_CONNECTION => handle_connection(inner, &name, id).await,
        NS_DISCOVER => handle_discover(inner, &name, id, payload).await,
        other => Err(RpcError::invalid_arguments(format!(
            "unknown namespace {:?}",
            other
        ))),
    }
}

async fn handle_rpc(
    inner: &Arc<ConnectionInner>,
    name: &str,
    id: u64,
    payload: Object,
) -> Result<()> {
    match name {
        "call" => {
            handle_call(inner, id, payload).await;
            Ok(())
        }
        "response" => {
            if let Some(call) = inner.pending.lock().remove(&id) {
                call.on_response(payload);
            } else {
                trace!(id, "response for unknown call");
            }
            Ok(())
        }
        "fragment" => {
            let call = inner.pending.lock().get(&id).cloned();
            match call {
                Some(call) => call.on_fragment(payload),
                None => trace!(id, "fragment for unknown call"),
            }
            Ok(())
        }
        "end" => {
            if let Some(call) = inner.pending.lock().remove(&id) {
                call.on_end();
            }
            Ok(())
        }
        "error" => {
            if let Some(call) = inner.pending.lock().remove(&id) {
                let error = if payload.is_error() {
                    payload
                } else {
                    Object::from(RpcError::internal("peer sent a malformed error"))
                };
                // Ingress of an error is a named boundary: record it.
                let _ = error.error_append_frame(file!(), line!() as u64, "call return");
                call.on_error(error);
            }
            Ok(())
        }
        "continue" => {
            let credit = payload
                .get_key("credit")
                .and_then(|c| c.as_u64().ok())
                .unwrap_or(1);
            let cx = inner.active.lock().get(&id).cloned();
            if let Some(cx) = cx {
                cx.grant(credit);
            }
            Ok(())
        }
        "abort" => {
            let cx = inner.active.lock().get(&id).cloned();
            if let Some(cx) = cx {
                cx.cancel();
            } else if let Some(call) = inner.pending.lock().remove(&id) {
                call.on_abort();
            }
            Ok(())
        }
        other => Err(RpcError::invalid_arguments(format!(
            "unknown rpc message {:?}",
            other
        ))),
    }
}

async fn reply_error(inner: &Arc<ConnectionInner>, id: u64, err: RpcError, boundary: &str) {
    if id == NO_REPLY_ID {
        return;
    }
    let error: Object = err.into();
    let _ = error.error_append_frame(file!(), line!() as u64, boundary);
    if let Err(send_err) = inner.send_envelope(NS_RPC, "error", id, Some(error)).await {
        trace!(error = %send_err, "could not deliver error reply");
    }
}

async fn handle_call(inner: &Arc<ConnectionInner>, id: u64, payload: Object) {
    let path = optional_str(&payload, "path").unwrap_or_else(|| ROOT_PATH.to_owned());
    let interface =
        optional_str(&payload, "interface").unwrap_or_else(|| DEFAULT_INTERFACE.to_owned());
    let Some(method) = optional_str(&payload, "method") else {
        reply_error(
            inner,
            id,
            RpcError::invalid_arguments("call names no method"),
            "dispatch",
        )
        .await;
        return;
    };
    let mut args = payload.get_key("args").unwrap_or_else(Object::null);

    let address = MethodAddress {
        path,
        interface,
        method,
    };

    let Some(context) = inner.context.clone() else {
        reply_error(
            inner,
            id,
            RpcError::not_found("connection has no dispatch context"),
            "dispatch",
        )
        .await;
        return;
    };

    let (instance, registered) =
        match context.lookup_method(&address.path, &address.interface, &address.method) {
            Ok(found) => found,
            Err(err) => {
                reply_error(inner, id, err, "dispatch").await;
                return;
            }
        };

    if let Some(hook) = context.pre_call_hook() {
        match hook(&address, &args) {
            Ok(Some(replacement)) => args = replacement,
            Ok(None) => {}
            Err(err) => {
                reply_error(inner, id, err, "pre-call hook").await;
                return;
            }
        }
    }

    let cx = ServerCallContext::new(
        id,
        address,
        Arc::downgrade(inner),
        instance.arg(),
        inner.transport.peer_cred(),
    );
    if id != NO_REPLY_ID {
        inner.active.lock().insert(id, cx.clone());
    }

    // One worker task per dispatched handler.
    let task_inner = inner.clone();
    tokio::spawn(async move {
        let outcome = AssertUnwindSafe((registered.handler)(cx.clone(), args))
            .catch_unwind()
            .await;
        task_inner.active.lock().remove(&cx.id());

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(RpcError::internal(format!(
                "handler {} panicked",
                cx.method()
            ))),
        };

        if !cx.is_aborted() && cx.id() != NO_REPLY_ID {
            finish_call(&task_inner, &cx, result).await;
        }

        if let Some(hook) = context.post_call_hook() {
            hook(cx.method());
        }
    });
}

/// Send whatever the handler's outcome maps to: a response, the stream end,
/// or an error object with one more stack frame.
async fn finish_call(inner: &Arc<ConnectionInner>, cx: &ServerCallContext, result: Result<Object>) {
    let id = cx.id();

    let outcome: Result<Object, Object> = match result {
        Ok(value) => {
            if let Some(pending) = cx.take_pending_error() {
                Err(pending)
            } else if value.is_error() {
                Err(value)
            } else if cx.is_streaming() || cx.end_already_sent() {
                if !cx.end_already_sent() {
                    if let Err(err) = inner.send_envelope(NS_RPC, "end", id, None).await {
                        trace!(error = %err, "could not deliver stream end");
                    }
                }
                return;
            } else {
                Ok(value)
            }
        }
        Err(err) if err.kind() == ErrorKind::Aborted => return,
        Err(err) => Err(err.into()),
    };

    match outcome {
        Ok(value) => {
            if let Err(err) = inner.send_envelope(NS_RPC, "response", id, Some(value)).await {
                trace!(error = %err, "could not deliver response");
            }
        }
        Err(error) => {
            let boundary = cx.method().to_string();
            let _ = error.error_append_frame(file!(), line!() as u64, &boundary);
            if let Err(err) = inner.send_envelope(NS_RPC, "error", id, Some(error)).await {
                trace!(error = %err, "could not deliver error");
            }
        }
    }
}

fn handle_events(inner: &Arc<ConnectionInner>, name: &str, payload: Object) {
    match name {
        "event" => {
            let path = optional_str(&payload, "path").unwrap_or_else(|| ROOT_PATH.to_owned());
            let interface = optional_str(&payload, "interface")
                .unwrap_or_else(|| DEFAULT_INTERFACE.to_owned());
            let Some(event_name) = optional_str(&payload, "name") else {
                warn!("event without a name");
                return;
            };
            let args = payload.get_key("args").unwrap_or_else(Object::null);

            let handlers = inner.event_handlers.lock().clone();
            for sub in handlers {
                if pattern_matches(sub.path.as_deref(), &path)
                    && pattern_matches(sub.interface.as_deref(), &interface)
                    && pattern_matches(sub.name.as_deref(), &event_name)
                {
                    (sub.handler)(&path, &interface, &event_name, args.clone());
                }
            }
        }
        "subscribe" => {
            let triple = PatternTriple {
                path: optional_str(&payload, "path"),
                interface: optional_str(&payload, "interface"),
                name: optional_str(&payload, "name"),
            };
            let mut subs = inner.peer_subscriptions.lock();
            if !subs.contains(&triple) {
                subs.push(triple);
            }
        }
        "unsubscribe" => {
            let triple = PatternTriple {
                path: optional_str(&payload, "path"),
                interface: optional_str(&payload, "interface"),
                name: optional_str(&payload, "name"),
            };
            inner.peer_subscriptions.lock().retain(|t| *t != triple);
        }
        other => warn!(name = other, "unknown events message"),
    }
}

async fn handle_connection(inner: &Arc<ConnectionInner>, name: &str, id: u64) -> Result<()> {
    match name {
        "ping" => inner.send_envelope(NS_CONNECTION, "pong", id, None).await,
        "pong" => {
            if let Some(waiter) = inner.pong_waiters.lock().pop_front() {
                let _ = waiter.send(());
            }
            Ok(())
        }
        "close" => {
            inner.shutdown(RpcError::transport_closed("peer closed the connection"));
            Ok(())
        }
        other => Err(RpcError::invalid_arguments(format!(
            "unknown connection message {:?}",
            other
        ))),
    }
}

async fn handle_discover(
    inner: &Arc<ConnectionInner>,
    name: &str,
    id: u64,
    payload: Object,
) -> Result<()> {
    let Some(context) = inner.context.clone() else {
        reply_error(
            inner,
            id,
            RpcError::not_found("connection has no dispatch context"),
            "discover",
        )
        .await;
        return Ok(());
    };

    let result = match name {
        "get_instances" => Ok(context.describe_instances()),
        "get_interfaces" => {
            let path = optional_str(&payload, "path").unwrap_or_else(|| ROOT_PATH.to_owned());
            context.describe_interfaces(&path)
        }
        "get_methods" => {
            let path = optional_str(&payload, "path").unwrap_or_else(|| ROOT_PATH.to_owned());
            let interface = optional_str(&payload, "interface");
            context.describe_methods(&path, interface.as_deref())
        }
        other => Err(RpcError::invalid_arguments(format!(
            "unknown discover message {:?}",
            other
        ))),
    };

    match result {
        Ok(value) => inner.send_envelope(NS_RPC, "response", id, Some(value)).await,
        Err(err) => {
            reply_error(inner, id, err, "discover").await;
            Ok(())
        }
    }
}
