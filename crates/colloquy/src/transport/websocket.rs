//! WebSocket transport.
//!
//! Each frame body travels as one binary WebSocket message; the framing and
//! masking are tungstenite's problem. No descriptor passing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Result, RpcError};
use crate::transport::{TransportBackend, WireFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

struct WsInner {
    tx: Mutex<SplitSink<WsStream, Message>>,
    rx: Mutex<SplitStream<WsStream>>,
    closed: AtomicBool,
    peer: String,
}

impl WebSocketTransport {
    fn new(ws: WsStream, peer: String) -> Self {
        let (tx, rx) = ws.split();
        WebSocketTransport {
            inner: Arc::new(WsInner {
                tx: Mutex::new(tx),
                rx: Mutex::new(rx),
                closed: AtomicBool::new(false),
                peer,
            }),
        }
    }

    pub async fn connect(url: &str) -> Result<WebSocketTransport> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            RpcError::transport_closed(format!("cannot connect to {}: {}", url, e))
        })?;
        Ok(Self::new(ws, url.to_owned()))
    }

    /// Upgrade an accepted TCP stream into a server-side endpoint.
    pub async fn accept(stream: TcpStream, peer: String) -> Result<WebSocketTransport> {
        let ws = tokio_tungstenite::accept_async(MaybeTlsStream::Plain(stream))
            .await
            .map_err(|e| {
                RpcError::transport_closed(format!("websocket handshake failed: {}", e))
            })?;
        Ok(Self::new(ws, format!("ws://{}", peer)))
    }

    fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

impl TransportBackend for WebSocketTransport {
    async fn send(&self, frame: WireFrame) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::transport_closed("websocket endpoint is closed"));
        }
        if !frame.fds.is_empty() {
            return Err(RpcError::unsupported_by_transport(
                "websocket transports cannot carry descriptors",
            ));
        }

        let mut tx = self.inner.tx.lock().await;
        tx.send(Message::Binary(frame.body.to_vec().into()))
            .await
            .map_err(|e| {
                self.mark_closed();
                RpcError::transport_closed(format!("websocket send failed: {}", e))
            })
    }

    async fn recv(&self) -> Result<WireFrame> {
        if self.is_closed() {
            return Err(RpcError::transport_closed("websocket endpoint is closed"));
        }

        let mut rx = self.inner.rx.lock().await;
        loop {
            match rx.next().await {
                Some(Ok(Message::Binary(body))) => {
                    return Ok(WireFrame {
                        body: Bytes::from(body.to_vec()),
                        fds: Vec::new(),
                    });
                }
                // Control traffic is tungstenite's to answer; text frames are
                // not part of the protocol and are skipped.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    self.mark_closed();
                    return Err(RpcError::transport_closed("websocket peer disconnected"));
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    self.mark_closed();
                    return Err(RpcError::transport_closed(format!(
                        "websocket recv failed: {}",
                        e
                    )));
                }
            }
        }
    }

    fn close(&self) {
        self.mark_closed();
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    async fn ws_pair() -> (WebSocketTransport, WebSocketTransport) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            WebSocketTransport::connect(&format!("ws://{}/rpc", addr))
                .await
                .unwrap()
        });
        let (stream, peer) = listener.accept().await.unwrap();
        let server = WebSocketTransport::accept(stream, peer.to_string())
            .await
            .unwrap();
        (client.await.unwrap(), server)
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (client, server) = ws_pair().await;

        client
            .send(WireFrame {
                body: Bytes::from_static(b"over websocket"),
                fds: Vec::new(),
            })
            .await
            .unwrap();

        let frame = server.recv().await.unwrap();
        assert_eq!(&frame.body[..], b"over websocket");
    }

    #[tokio::test]
    async fn descriptors_are_refused() {
        let (client, _server) = ws_pair().await;

        let fd = unsafe { std::os::fd::OwnedFd::from_raw_fd(libc::dup(0)) };
        let err = client
            .send(WireFrame {
                body: Bytes::from_static(b"x"),
                fds: vec![fd],
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnsupportedByTransport);
    }
}
