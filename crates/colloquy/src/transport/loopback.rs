//! In-process transport pair used by tests and same-process servers.
//!
//! Frames travel over bounded channels; descriptors move by value, so a
//! loopback connection exercises the full descriptor-passing path without
//! touching a socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::LazyLock;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, mpsc};

use crate::error::{Result, RpcError};
use crate::transport::{TransportBackend, WireFrame};

const CHANNEL_CAPACITY: usize = 64;

static LISTENERS: LazyLock<SyncMutex<HashMap<String, mpsc::Sender<LoopbackTransport>>>> =
    LazyLock::new(|| SyncMutex::new(HashMap::new()));

static PAIR_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
}

#[derive(Debug)]
struct LoopbackInner {
    tx: mpsc::Sender<WireFrame>,
    rx: Mutex<mpsc::Receiver<WireFrame>>,
    closed: AtomicBool,
    peer: String,
}

impl LoopbackTransport {
    /// Create a connected pair of in-process endpoints.
    pub fn pair(id: &str) -> (Self, Self) {
        let serial = PAIR_SEQ.fetch_add(1, Ordering::Relaxed);
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let a = LoopbackTransport {
            inner: Arc::new(LoopbackInner {
                tx: tx_b,
                rx: Mutex::new(rx_a),
                closed: AtomicBool::new(false),
                peer: format!("loopback://{}#{}", id, serial),
            }),
        };
        let b = LoopbackTransport {
            inner: Arc::new(LoopbackInner {
                tx: tx_a,
                rx: Mutex::new(rx_b),
                closed: AtomicBool::new(false),
                peer: format!("loopback://{}#{}", id, serial),
            }),
        };

        (a, b)
    }

    /// Connect to an in-process listener bound to `id`.
    pub async fn connect(id: &str) -> Result<LoopbackTransport> {
        let sender = LISTENERS
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| {
                RpcError::not_found(format!("no loopback listener bound to {:?}", id))
            })?;

        let (local, remote) = Self::pair(id);
        sender.send(remote).await.map_err(|_| {
            RpcError::transport_closed(format!("loopback listener {:?} is gone", id))
        })?;
        Ok(local)
    }

    fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl TransportBackend for LoopbackTransport {
    async fn send(&self, frame: WireFrame) -> Result<()> {
        if self.closed() {
            return Err(RpcError::transport_closed("loopback endpoint is closed"));
        }
        self.inner
            .tx
            .send(frame)
            .await
            .map_err(|_| RpcError::transport_closed("loopback peer is gone"))
    }

    async fn recv(&self) -> Result<WireFrame> {
        if self.closed() {
            return Err(RpcError::transport_closed("loopback endpoint is closed"));
        }
        let frame = {
            let mut rx = self.inner.rx.lock().await;
            rx.recv().await
        };
        frame.ok_or_else(|| RpcError::transport_closed("loopback peer is gone"))
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed()
    }

    fn supports_fd_passing(&self) -> bool {
        true
    }

    fn peer_label(&self) -> String {
        self.inner.peer.clone()
    }
}

/// Accepting side of the in-process transport, registered process-wide under
/// its id. Dropping the listener releases the id.
pub struct LoopbackListener {
    id: String,
    rx: Mutex<mpsc::Receiver<LoopbackTransport>>,
}

impl LoopbackListener {
    pub fn bind(id: &str) -> Result<LoopbackListener> {
        let mut listeners = LISTENERS.lock();
        if listeners.contains_key(id) {
            return Err(RpcError::invalid_arguments(format!(
                "loopback id {:?} is already bound",
                id
            )));
        }
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        listeners.insert(id.to_owned(), tx);
        Ok(LoopbackListener {
            id: id.to_owned(),
            rx: Mutex::new(rx),
        })
    }

    pub async fn accept(&self) -> Result<LoopbackTransport> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| RpcError::transport_closed("loopback listener is closed"))
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        LISTENERS.lock().remove(&self.id);
    }
}
