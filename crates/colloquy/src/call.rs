//! Per-invocation state machines.
//!
//! [`Call`] is the client view of one method invocation: a status, a bounded
//! fragment queue and the prefetch credit that meters how far ahead the
//! server may stream. [`ServerCallContext`] is the inverse view handed to a
//! handler: the yield primitive, the abort flag and the per-instance
//! argument.
//!
//! Flow control is a credit counter. The client starts a call with one
//! implicit credit (so the first fragment flows without a round trip),
//! `continue_` grants one more, and `set_prefetch(n)` tops the outstanding
//! grant up to `n`. A server-side yield consumes a credit or blocks until
//! one arrives; closing the connection or an `rpc.abort` wakes the blocked
//! yield with an `aborted` error so the handler can unwind.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::connection::{ConnectionInner, NS_RPC};
use crate::context::{InstanceArg, MethodAddress};
use crate::error::{Result, RpcError};
use crate::object::Object;
use crate::transport::PeerCred;

/// Client-side call status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallStatus {
    /// Sent, no reply yet (also: streaming with an empty queue).
    InProgress,
    /// First fragment arrived; the call is a stream.
    StreamStart,
    /// At least one fragment is queued for consumption.
    MoreAvailable,
    /// Single reply received.
    Done,
    /// Stream finished and every fragment was consumed.
    Ended,
    /// The peer replied with an error object.
    Error,
    /// Locally or remotely aborted.
    Aborted,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Done | CallStatus::Ended | CallStatus::Error | CallStatus::Aborted
        )
    }
}

pub(crate) struct CallState {
    pub status: CallStatus,
    pub fragments: VecDeque<Object>,
    pub result: Option<Object>,
    /// `rpc.end` arrived while fragments were still queued.
    pub end_pending: bool,
    pub seen_fragment: bool,
    /// Credits granted to the peer, including the implicit initial credit.
    pub granted: u64,
    /// Fragments received so far.
    pub delivered: u64,
    pub prefetch: u32,
}

pub(crate) struct CallInner {
    pub id: u64,
    pub method: MethodAddress,
    pub conn: Weak<ConnectionInner>,
    pub state: Mutex<CallState>,
    pub notify: Notify,
}

impl CallInner {
    pub(crate) fn new(id: u64, method: MethodAddress, conn: Weak<ConnectionInner>) -> Arc<Self> {
        Arc::new(CallInner {
            id,
            method,
            conn,
            state: Mutex::new(CallState {
                status: CallStatus::InProgress,
                fragments: VecDeque::new(),
                result: None,
                end_pending: false,
                seen_fragment: false,
                granted: 1,
                delivered: 0,
                prefetch: 0,
            }),
            notify: Notify::new(),
        })
    }

    pub(crate) fn on_response(&self, payload: Object) {
        let mut st = self.state.lock();
        if st.status.is_terminal() {
            return;
        }
        st.status = CallStatus::Done;
        st.result = Some(payload);
        drop(st);
        self.notify.notify_waiters();
    }

    pub(crate) fn on_fragment(&self, fragment: Object) {
        let mut st = self.state.lock();
        if st.status.is_terminal() {
            return;
        }
        st.delivered += 1;
        st.fragments.push_back(fragment);
        st.status = if st.seen_fragment {
            CallStatus::MoreAvailable
        } else {
            st.seen_fragment = true;
            CallStatus::StreamStart
        };
        drop(st);
        self.notify.notify_waiters();
    }

    pub(crate) fn on_end(&self) {
        let mut st = self.state.lock();
        if st.status.is_terminal() {
            return;
        }
        if st.fragments.is_empty() {
            st.status = CallStatus::Ended;
        } else {
            // Queued fragments are delivered before the call ends.
            st.end_pending = true;
        }
        drop(st);
        self.notify.notify_waiters();
    }

    pub(crate) fn on_error(&self, error: Object) {
        let mut st = self.state.lock();
        if st.status.is_terminal() {
            return;
        }
        st.status = CallStatus::Error;
        st.result = Some(error);
        drop(st);
        self.notify.notify_waiters();
    }

    pub(crate) fn on_abort(&self) {
        let mut st = self.state.lock();
        if st.status.is_terminal() {
            return;
        }
        st.status = CallStatus::Aborted;
        drop(st);
        self.notify.notify_waiters();
    }

    pub(crate) fn fail(&self, err: RpcError) {
        let error: Object = err.into();
        let _ = error.error_append_frame(file!(), line!() as u64, "connection reader");
        self.on_error(error);
    }
}

/// Client-side handle to one method invocation.
#[derive(Clone)]
pub struct Call {
    pub(crate) inner: Arc<CallInner>,
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call").field("id", &self.inner.id).finish()
    }
}

impl Call {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn method(&self) -> &MethodAddress {
        &self.inner.method
    }

    pub fn status(&self) -> CallStatus {
        self.inner.state.lock().status
    }

    /// The current consumable value: the single reply once `Done`, the
    /// front fragment while streaming, the error object on `Error`.
    pub fn result(&self) -> Option<Object> {
        let st = self.inner.state.lock();
        match st.status {
            CallStatus::Done | CallStatus::Error => st.result.clone(),
            CallStatus::StreamStart | CallStatus::MoreAvailable => st.fragments.front().cloned(),
            _ => None,
        }
    }

    /// Block until the call has something to act on: a terminal status or a
    /// queued fragment.
    pub async fn wait(&self) -> CallStatus {
        loop {
            let notified = self.inner.notify.notified();
            {
                let st = self.inner.state.lock();
                if st.status.is_terminal() || !st.fragments.is_empty() {
                    return st.status;
                }
            }
            notified.await;
        }
    }

    /// Like [`Call::wait`], but gives up after `deadline` with a `timeout`
    /// error. A timeout leaves the call state untouched; the call stays live
    /// until explicitly aborted.
    pub async fn wait_deadline(&self, deadline: Duration) -> Result<CallStatus> {
        tokio::time::timeout(deadline, self.wait())
            .await
            .map_err(|_| RpcError::timeout(format!("no transition within {:?}", deadline)))
    }

    /// Advance the stream: consume the current fragment and grant the server
    /// credit for more. With `sync`, block until the next transition.
    pub async fn continue_(&self, sync: bool) -> Result<()> {
        let grant = {
            let mut st = self.inner.state.lock();
            match st.status {
                CallStatus::StreamStart => {
                    // Nothing consumed yet; the first fragment becomes
                    // current.
                    st.status = if st.fragments.is_empty() {
                        CallStatus::InProgress
                    } else {
                        CallStatus::MoreAvailable
                    };
                }
                CallStatus::MoreAvailable => {
                    st.fragments.pop_front();
                    if st.fragments.is_empty() {
                        st.status = if st.end_pending {
                            CallStatus::Ended
                        } else {
                            CallStatus::InProgress
                        };
                    }
                }
                _ => return Ok(()),
            }

            if st.status.is_terminal() {
                0
            } else {
                // Top the outstanding grant up to the prefetch credit (at
                // least one, so the stream keeps moving).
                let target = u64::from(st.prefetch.max(1));
                let outstanding = st.granted.saturating_sub(st.delivered);
                let grant = target.saturating_sub(outstanding);
                st.granted += grant;
                grant
            }
        };
        self.inner.notify.notify_waiters();

        if grant > 0 {
            if let Some(conn) = self.inner.conn.upgrade() {
                let payload = Object::dict_from([("credit", Object::uint64(grant))]);
                conn.send_envelope(NS_RPC, "continue", self.inner.id, Some(payload))
                    .await?;
            }
        }

        if sync {
            self.wait().await;
        }
        Ok(())
    }

    /// Set the prefetch credit: how many fragments the client is willing to
    /// buffer ahead of consumption. Lowering the credit below the current
    /// queue length keeps already-queued fragments and only bounds further
    /// admittance.
    pub async fn set_prefetch(&self, prefetch: u32) -> Result<()> {
        let grant = {
            let mut st = self.inner.state.lock();
            st.prefetch = prefetch;
            if st.status.is_terminal() {
                0
            } else {
                let outstanding = st.granted.saturating_sub(st.delivered);
                let grant = u64::from(prefetch).saturating_sub(outstanding);
                st.granted += grant;
                grant
            }
        };

        if grant > 0 {
            if let Some(conn) = self.inner.conn.upgrade() {
                let payload = Object::dict_from([("credit", Object::uint64(grant))]);
                conn.send_envelope(NS_RPC, "continue", self.inner.id, Some(payload))
                    .await?;
            }
        }
        Ok(())
    }

    /// Abort the call locally and tell the peer.
    pub async fn abort(&self) -> Result<()> {
        {
            let mut st = self.inner.state.lock();
            if st.status.is_terminal() {
                return Ok(());
            }
            st.status = CallStatus::Aborted;
        }
        self.inner.notify.notify_waiters();

        if let Some(conn) = self.inner.conn.upgrade() {
            conn.forget_call(self.inner.id);
            conn.send_envelope(NS_RPC, "abort", self.inner.id, None).await?;
        }
        Ok(())
    }
}

pub(crate) struct ServerCallInner {
    pub id: u64,
    pub method: MethodAddress,
    pub conn: Weak<ConnectionInner>,
    pub credits: Mutex<u64>,
    pub credit_notify: Notify,
    pub aborted: AtomicBool,
    pub streaming: AtomicBool,
    pub end_sent: AtomicBool,
    pub pending_error: Mutex<Option<Object>>,
    pub instance_arg: Option<InstanceArg>,
    pub peer_cred: Option<PeerCred>,
}

/// Server-side view of one invocation, handed to the handler.
#[derive(Clone)]
pub struct ServerCallContext {
    pub(crate) inner: Arc<ServerCallInner>,
}

impl ServerCallContext {
    pub(crate) fn new(
        id: u64,
        method: MethodAddress,
        conn: Weak<ConnectionInner>,
        instance_arg: Option<InstanceArg>,
        peer_cred: Option<PeerCred>,
    ) -> Self {
        ServerCallContext {
            inner: Arc::new(ServerCallInner {
                id,
                method,
                conn,
                credits: Mutex::new(1),
                credit_notify: Notify::new(),
                aborted: AtomicBool::new(false),
                streaming: AtomicBool::new(false),
                end_sent: AtomicBool::new(false),
                pending_error: Mutex::new(None),
                instance_arg,
                peer_cred,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn method(&self) -> &MethodAddress {
        &self.inner.method
    }

    /// The opaque argument of the instance this call was dispatched on.
    pub fn instance_arg(&self) -> Option<InstanceArg> {
        self.inner.instance_arg.clone()
    }

    /// Credentials of the calling process, when the transport provides them.
    pub fn peer_cred(&self) -> Option<PeerCred> {
        self.inner.peer_cred
    }

    /// Whether the peer aborted the call. A well-written streaming handler
    /// checks this (or the error from `yield_`) and unwinds promptly.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::Acquire)
    }

    pub(crate) fn end_already_sent(&self) -> bool {
        self.inner.end_sent.load(Ordering::Acquire)
    }

    pub(crate) fn take_pending_error(&self) -> Option<Object> {
        self.inner.pending_error.lock().take()
    }

    /// Emit one fragment. Blocks while the client's prefetch credit is
    /// exhausted; fails with `aborted` once the peer cancels or the
    /// connection goes away, which is the handler's signal to unwind.
    pub async fn yield_(&self, fragment: Object) -> Result<()> {
        loop {
            if self.is_aborted() {
                return Err(RpcError::aborted("call was aborted"));
            }
            let Some(conn) = self.inner.conn.upgrade() else {
                return Err(RpcError::aborted("connection is gone"));
            };
            if conn.is_closed() {
                return Err(RpcError::aborted("connection is closed"));
            }

            let notified = self.inner.credit_notify.notified();
            let has_credit = {
                let mut credits = self.inner.credits.lock();
                if *credits > 0 {
                    *credits -= 1;
                    true
                } else {
                    false
                }
            };
            if has_credit {
                self.inner.streaming.store(true, Ordering::Release);
                return conn
                    .send_envelope(NS_RPC, "fragment", self.inner.id, Some(fragment))
                    .await;
            }
            notified.await;
        }
    }

    /// Explicitly finish the stream before returning from the handler.
    pub async fn end(&self) -> Result<()> {
        if self.inner.end_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(conn) = self.inner.conn.upgrade() else {
            return Err(RpcError::aborted("connection is gone"));
        };
        conn.send_envelope(NS_RPC, "end", self.inner.id, None).await
    }

    /// Arrange for the call to fail with `code`/`message` once the handler
    /// returns.
    pub fn error(&self, code: i64, message: &str) {
        *self.inner.pending_error.lock() = Some(Object::error(code, message));
    }

    /// Arrange for the call to fail with a prebuilt error object.
    pub fn error_object(&self, error: Object) {
        *self.inner.pending_error.lock() = Some(error);
    }

    pub(crate) fn grant(&self, credits: u64) {
        *self.inner.credits.lock() += credits;
        self.inner.credit_notify.notify_waiters();
    }

    pub(crate) fn cancel(&self) {
        self.inner.aborted.store(true, Ordering::Release);
        self.inner.credit_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orphan_call() -> Call {
        Call {
            inner: CallInner::new(
                1,
                MethodAddress {
                    path: "/".to_owned(),
                    interface: "test".to_owned(),
                    method: "m".to_owned(),
                },
                Weak::new(),
            ),
        }
    }

    #[test]
    fn response_transitions_to_done() {
        let call = orphan_call();
        call.inner.on_response(Object::string("reply"));

        assert_eq!(call.status(), CallStatus::Done);
        assert_eq!(call.result().unwrap().as_str().unwrap(), "reply");
    }

    #[test]
    fn first_fragment_is_stream_start() {
        let call = orphan_call();
        call.inner.on_fragment(Object::int64(1));
        assert_eq!(call.status(), CallStatus::StreamStart);

        call.inner.on_fragment(Object::int64(2));
        assert_eq!(call.status(), CallStatus::MoreAvailable);
    }

    #[tokio::test]
    async fn fragments_drain_in_order_then_end() {
        let call = orphan_call();
        call.inner.on_fragment(Object::int64(1));
        call.inner.on_fragment(Object::int64(2));
        call.inner.on_end();

        // End with queued fragments is deferred until the queue drains.
        assert_eq!(call.status(), CallStatus::MoreAvailable);
        assert_eq!(call.result().unwrap().as_i64().unwrap(), 1);

        call.continue_(false).await.unwrap();
        assert_eq!(call.result().unwrap().as_i64().unwrap(), 2);

        call.continue_(false).await.unwrap();
        assert_eq!(call.status(), CallStatus::Ended);
    }

    #[test]
    fn error_overrides_stream() {
        let call = orphan_call();
        call.inner.on_fragment(Object::int64(1));
        call.inner.on_error(Object::error(38, "It broke!"));

        assert_eq!(call.status(), CallStatus::Error);
        assert_eq!(call.result().unwrap().error_code().unwrap(), 38);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let call = orphan_call();
        call.inner.on_response(Object::null());
        call.inner.on_error(Object::error(1, "late"));
        assert_eq!(call.status(), CallStatus::Done);
    }

    #[tokio::test]
    async fn wait_deadline_times_out_without_state_change() {
        let call = orphan_call();
        let err = call
            .wait_deadline(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
        assert_eq!(call.status(), CallStatus::InProgress);
    }

    #[tokio::test]
    async fn wait_returns_immediately_on_queued_fragment() {
        let call = orphan_call();
        call.inner.on_fragment(Object::int64(7));
        assert_eq!(call.wait().await, CallStatus::StreamStart);
    }

    #[tokio::test]
    async fn yield_fails_after_cancel() {
        let cx = ServerCallContext::new(
            1,
            MethodAddress {
                path: "/".to_owned(),
                interface: "test".to_owned(),
                method: "m".to_owned(),
            },
            Weak::new(),
            None,
            None,
        );
        cx.cancel();
        let err = cx.yield_(Object::null()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Aborted);
    }
}
