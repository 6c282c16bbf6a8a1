//! TCP stream transport.
//!
//! Frames are length-prefixed: `[body_len u32 LE][nfds u32 LE][body]`.
//! TCP cannot carry descriptors, so `nfds` is always zero; a frame with
//! attachments fails with `unsupported-by-transport` before anything is
//! written.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::error::{Result, RpcError};
use crate::transport::{TransportBackend, WireFrame};

pub(crate) const FRAME_HEADER_LEN: usize = 8;

/// Maximum accepted frame body, a guard against garbage length prefixes.
pub(crate) const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    peer: String,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, peer: String) -> Self {
        // Latency beats throughput for small RPC frames.
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        TcpTransport {
            inner: Arc::new(TcpInner {
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
                closed: AtomicBool::new(false),
                peer,
            }),
        }
    }

    pub async fn connect(host: &str, port: u16) -> Result<TcpTransport> {
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            RpcError::transport_closed(format!("cannot connect to tcp://{}:{}: {}", host, port, e))
        })?;
        let peer = stream
            .peer_addr()
            .map(|a| format!("tcp://{}", a))
            .unwrap_or_else(|_| format!("tcp://{}:{}", host, port));
        Ok(Self::new(stream, peer))
    }

    fn fail_closed(&self, context: &str, err: std::io::Error) -> RpcError {
        self.inner.closed.store(true, Ordering::Release);
        RpcError::transport_closed(format!("{}: {}", context, err))
    }
}

impl TransportBackend for TcpTransport {
    async fn send(&self, frame: WireFrame) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::transport_closed("tcp endpoint is closed"));
        }
        if !frame.fds.is_empty() {
            return Err(RpcError::unsupported_by_transport(
                "tcp transports cannot carry descriptors",
            ));
        }

        let mut msg = Vec::with_capacity(FRAME_HEADER_LEN + frame.body.len());
        msg.extend_from_slice(&(frame.body.len() as u32).to_le_bytes());
        msg.extend_from_slice(&0u32.to_le_bytes());
        msg.extend_from_slice(&frame.body);

        let mut writer = self.inner.writer.lock().await;
        writer
            .write_all(&msg)
            .await
            .map_err(|e| self.fail_closed("tcp send failed", e))
    }

    async fn recv(&self) -> Result<WireFrame> {
        if self.is_closed() {
            return Err(RpcError::transport_closed("tcp endpoint is closed"));
        }

        let mut reader = self.inner.reader.lock().await;

        let mut header = [0u8; FRAME_HEADER_LEN];
        reader
            .read_exact(&mut header)
            .await
            .map_err(|e| self.fail_closed("tcp recv failed", e))?;

        let body_len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let nfds = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if nfds != 0 {
            return Err(RpcError::unsupported_by_transport(
                "peer attached descriptors to a tcp frame",
            ));
        }
        if body_len > MAX_FRAME_LEN {
            self.inner.closed.store(true, Ordering::Release);
            return Err(RpcError::transport_closed(format!(
                "tcp frame of {} bytes exceeds the frame limit",
                body_len
            )));
        }

        let mut body = vec![0u8; body_len];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| self.fail_closed("tcp recv failed", e))?;

        Ok(WireFrame {
            body: Bytes::from(body),
            fds: Vec::new(),
        })
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn supports_fd_passing(&self) -> bool {
        false
    }

    fn peer_label(&self) -> String {
        self.inner.peer.clone()
    }
}
