//! Server: ties a listening endpoint to a [`Context`].
//!
//! The accept loop parks fresh transports until [`Server::resume`] is
//! called, so a process can finish registering its instances before the
//! first call is dispatched.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::connection::Connection;
use crate::context::{Context, DEFAULT_INTERFACE, ROOT_PATH};
use crate::error::Result;
use crate::object::Object;
use crate::transport::{Listener, Uri};

/// Connection lifecycle notifications delivered to the server's event
/// handler slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    Connect,
    Disconnect,
}

pub type ServerEventHandler = Arc<dyn Fn(&Connection, ServerEvent) + Send + Sync>;

struct ServerInner {
    context: Context,
    local_uri: String,
    connections: SyncMutex<Vec<Connection>>,
    resumed: AtomicBool,
    resume_notify: Notify,
    closed: AtomicBool,
    accept_task: SyncMutex<Option<JoinHandle<()>>>,
    event_handler: SyncMutex<Option<ServerEventHandler>>,
}

/// A listening RPC endpoint dispatching into a shared [`Context`].
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Bind `uri` and start accepting. Dispatch stays parked until
    /// [`Server::resume`].
    pub async fn listen(uri: &str, context: Context) -> Result<Server> {
        let parsed = Uri::parse(uri)?;
        let listener = Listener::bind(&parsed).await?;
        let local_uri = listener.local_uri();

        let inner = Arc::new(ServerInner {
            context,
            local_uri,
            connections: SyncMutex::new(Vec::new()),
            resumed: AtomicBool::new(false),
            resume_notify: Notify::new(),
            closed: AtomicBool::new(false),
            accept_task: SyncMutex::new(None),
            event_handler: SyncMutex::new(None),
        });

        let accept_inner = inner.clone();
        let task = tokio::spawn(async move { accept_loop(accept_inner, listener).await });
        *inner.accept_task.lock() = Some(task);

        Ok(Server { inner })
    }

    /// Allow accepted connections to start dispatching.
    pub fn resume(&self) {
        self.inner.resumed.store(true, Ordering::Release);
        self.inner.resume_notify.notify_waiters();
    }

    /// The bound address, with ephemeral ports resolved.
    pub fn local_uri(&self) -> &str {
        &self.inner.local_uri
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.connections.lock().clone()
    }

    /// Install the connect/disconnect notification handler.
    pub fn set_event_handler(&self, handler: ServerEventHandler) {
        *self.inner.event_handler.lock() = Some(handler);
    }

    /// Deliver an event to every connected client subscribed to it.
    /// Best-effort: delivery failures are logged and dropped.
    pub async fn broadcast_event(
        &self,
        path: Option<&str>,
        interface: Option<&str>,
        name: &str,
        args: Object,
    ) {
        let path = path.unwrap_or(ROOT_PATH);
        let interface = interface.unwrap_or(DEFAULT_INTERFACE);

        let connections = self.connections();
        for conn in connections {
            if !conn.peer_subscribed_to(path, interface, name) {
                continue;
            }
            if let Err(err) = conn.emit_event(Some(path), Some(interface), name, args.clone()).await
            {
                trace!(error = %err, "event delivery failed");
            }
        }
    }

    /// Stop accepting and close every connection.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = self.inner.accept_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        let connections: Vec<Connection> = self.inner.connections.lock().drain(..).collect();
        for conn in connections {
            conn.close().await;
        }
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: Listener) {
    loop {
        let transport = match listener.accept().await {
            Ok(transport) => transport,
            Err(err) => {
                if !inner.closed.load(Ordering::Acquire) {
                    warn!(error = %err, "accept failed, stopping listener");
                }
                break;
            }
        };

        // Park until the server is resumed.
        loop {
            let notified = inner.resume_notify.notified();
            if inner.resumed.load(Ordering::Acquire) {
                break;
            }
            notified.await;
        }

        let conn = match Connection::new(transport, Some(inner.context.clone()), None) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "could not set up connection");
                continue;
            }
        };

        inner.connections.lock().push(conn.clone());
        let handler = inner.event_handler.lock().clone();
        if let Some(handler) = handler {
            handler(&conn, ServerEvent::Connect);
        }

        // Reap the connection when its reader stops.
        let watch_inner = inner.clone();
        let watch_conn = conn.clone();
        tokio::spawn(async move {
            watch_conn.wait_closed().await;
            watch_inner
                .connections
                .lock()
                .retain(|c| !Connection::ptr_eq(c, &watch_conn));
            let handler = watch_inner.event_handler.lock().clone();
            if let Some(handler) = handler {
                handler(&watch_conn, ServerEvent::Disconnect);
            }
        });
    }
}
