//! Transport enum and internal backend trait.
//!
//! The public API is the [`Transport`] enum. Each backend lives in its own
//! module under `transport/` and implements the internal `TransportBackend`
//! trait; the enum forwards to whichever backend it wraps.
//!
//! Recognised URI schemes:
//!
//! - `unix://<path>`: Unix domain stream socket, supports descriptor passing
//! - `tcp://<host>:<port>`: TCP stream, no descriptor passing
//! - `ws://<host>:<port>/<path>`: WebSocket binary frames, no descriptor passing
//! - `loopback://<id>`: in-process pair, descriptors move by value
//! - `bus://<name>`: resolved through the directory service before dialing

use std::fmt;
use std::os::fd::OwnedFd;

use bytes::Bytes;

use crate::error::{Result, RpcError};
use crate::object::Object;

pub mod loopback;
pub mod tcp;
pub mod unix;
pub mod websocket;

pub use loopback::{LoopbackListener, LoopbackTransport};
pub use tcp::TcpTransport;
pub use unix::UnixTransport;
pub use websocket::WebSocketTransport;

/// One message on the wire: a serialized body plus out-of-band descriptors.
#[derive(Debug)]
pub(crate) struct WireFrame {
    pub body: Bytes,
    pub fds: Vec<OwnedFd>,
}

pub(crate) trait TransportBackend: Send + Sync {
    async fn send(&self, frame: WireFrame) -> Result<()>;
    async fn recv(&self) -> Result<WireFrame>;
    fn close(&self);
    fn is_closed(&self) -> bool;
    fn supports_fd_passing(&self) -> bool;
    fn peer_label(&self) -> String;
}

/// Transport-level peer credentials, available on Unix domain sockets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerCred {
    pub pid: Option<i32>,
    pub uid: u32,
    pub gid: u32,
}

/// URI scheme of a transport endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Unix,
    Tcp,
    Ws,
    Loopback,
    Bus,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Unix => "unix",
            Scheme::Tcp => "tcp",
            Scheme::Ws => "ws",
            Scheme::Loopback => "loopback",
            Scheme::Bus => "bus",
        }
    }
}

/// A parsed endpoint URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Uri {
    scheme: Scheme,
    rest: String,
}

impl Uri {
    pub fn parse(uri: &str) -> Result<Uri> {
        let (scheme, rest) = uri.split_once("://").ok_or_else(|| {
            RpcError::invalid_arguments(format!("URI {:?} has no scheme", uri))
        })?;

        let scheme = match scheme {
            "unix" => Scheme::Unix,
            "tcp" => Scheme::Tcp,
            "ws" => Scheme::Ws,
            "loopback" => Scheme::Loopback,
            "bus" => Scheme::Bus,
            other => {
                return Err(RpcError::invalid_arguments(format!(
                    "unknown URI scheme {:?}",
                    other
                )));
            }
        };

        if rest.is_empty() {
            return Err(RpcError::invalid_arguments(format!(
                "URI {:?} has an empty address",
                uri
            )));
        }

        Ok(Uri {
            scheme,
            rest: rest.to_owned(),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Socket path of a `unix://` URI.
    pub fn unix_path(&self) -> &str {
        &self.rest
    }

    /// Host and port of a `tcp://` or `ws://` URI.
    pub fn host_port(&self) -> Result<(String, u16)> {
        let authority = match self.scheme {
            Scheme::Ws => self.rest.split('/').next().unwrap_or(&self.rest),
            _ => &self.rest,
        };
        let (host, port) = authority.rsplit_once(':').ok_or_else(|| {
            RpcError::invalid_arguments(format!("URI {:?} has no port", self))
        })?;
        let port: u16 = port.parse().map_err(|_| {
            RpcError::invalid_arguments(format!("URI {:?} has an invalid port", self))
        })?;
        Ok((host.to_owned(), port))
    }

    /// Identifier of a `loopback://` URI.
    pub fn loopback_id(&self) -> &str {
        &self.rest
    }

    /// Service name of a `bus://` URI.
    pub fn bus_name(&self) -> &str {
        &self.rest
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.rest)
    }
}

/// Combined transport handle over every backend.
#[derive(Clone)]
pub enum Transport {
    Unix(UnixTransport),
    Tcp(TcpTransport),
    WebSocket(WebSocketTransport),
    Loopback(LoopbackTransport),
}

impl Transport {
    /// Dial the endpoint named by `uri`. `options` carries transport-specific
    /// knobs as a dictionary; unknown keys are ignored.
    pub async fn connect(uri: &Uri, options: Option<&Object>) -> Result<Transport> {
        let _ = options;
        match uri.scheme() {
            Scheme::Unix => Ok(Transport::Unix(UnixTransport::connect(uri.unix_path()).await?)),
            Scheme::Tcp => {
                let (host, port) = uri.host_port()?;
                Ok(Transport::Tcp(TcpTransport::connect(&host, port).await?))
            }
            Scheme::Ws => Ok(Transport::WebSocket(
                WebSocketTransport::connect(&uri.to_string()).await?,
            )),
            Scheme::Loopback => Ok(Transport::Loopback(
                LoopbackTransport::connect(uri.loopback_id()).await?,
            )),
            Scheme::Bus => Err(RpcError::invalid_arguments(
                "bus URIs must be resolved through the directory service before dialing",
            )),
        }
    }

    /// An in-process pair for tests and loopback servers.
    pub fn loopback_pair() -> (Transport, Transport) {
        let (a, b) = LoopbackTransport::pair("pair");
        (Transport::Loopback(a), Transport::Loopback(b))
    }

    pub(crate) async fn send(&self, frame: WireFrame) -> Result<()> {
        match self {
            Transport::Unix(t) => t.send(frame).await,
            Transport::Tcp(t) => t.send(frame).await,
            Transport::WebSocket(t) => t.send(frame).await,
            Transport::Loopback(t) => t.send(frame).await,
        }
    }

    pub(crate) async fn recv(&self) -> Result<WireFrame> {
        match self {
            Transport::Unix(t) => t.recv().await,
            Transport::Tcp(t) => t.recv().await,
            Transport::WebSocket(t) => t.recv().await,
            Transport::Loopback(t) => t.recv().await,
        }
    }

    /// Initiate shutdown; outstanding sends and receives fail with
    /// `transport-closed`.
    pub fn close(&self) {
        match self {
            Transport::Unix(t) => TransportBackend::close(t),
            Transport::Tcp(t) => TransportBackend::close(t),
            Transport::WebSocket(t) => TransportBackend::close(t),
            Transport::Loopback(t) => TransportBackend::close(t),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Transport::Unix(t) => t.is_closed(),
            Transport::Tcp(t) => t.is_closed(),
            Transport::WebSocket(t) => t.is_closed(),
            Transport::Loopback(t) => t.is_closed(),
        }
    }

    /// Whether descriptors can travel out-of-band on this transport.
    pub fn supports_fd_passing(&self) -> bool {
        match self {
            Transport::Unix(t) => t.supports_fd_passing(),
            Transport::Tcp(t) => t.supports_fd_passing(),
            Transport::WebSocket(t) => t.supports_fd_passing(),
            Transport::Loopback(t) => t.supports_fd_passing(),
        }
    }

    /// Human-readable description of the remote endpoint.
    pub fn peer_label(&self) -> String {
        match self {
            Transport::Unix(t) => t.peer_label(),
            Transport::Tcp(t) => t.peer_label(),
            Transport::WebSocket(t) => t.peer_label(),
            Transport::Loopback(t) => t.peer_label(),
        }
    }

    /// Credentials of the peer process, when the transport exposes them.
    pub fn peer_cred(&self) -> Option<PeerCred> {
        match self {
            Transport::Unix(t) => t.peer_cred(),
            _ => None,
        }
    }
}

/// Accepting counterpart of [`Transport`].
pub enum Listener {
    Unix(tokio::net::UnixListener, String),
    Tcp(tokio::net::TcpListener),
    Ws(tokio::net::TcpListener),
    Loopback(LoopbackListener),
}

impl Listener {
    pub async fn bind(uri: &Uri) -> Result<Listener> {
        match uri.scheme() {
            Scheme::Unix => {
                let path = uri.unix_path();
                // A stale socket file from a previous run would fail the bind.
                let _ = std::fs::remove_file(path);
                let listener = tokio::net::UnixListener::bind(path).map_err(|e| {
                    RpcError::transport_closed(format!("cannot bind {}: {}", uri, e))
                })?;
                Ok(Listener::Unix(listener, path.to_owned()))
            }
            Scheme::Tcp => {
                let (host, port) = uri.host_port()?;
                let listener = tokio::net::TcpListener::bind((host.as_str(), port))
                    .await
                    .map_err(|e| {
                        RpcError::transport_closed(format!("cannot bind {}: {}", uri, e))
                    })?;
                Ok(Listener::Tcp(listener))
            }
            Scheme::Ws => {
                let (host, port) = uri.host_port()?;
                let listener = tokio::net::TcpListener::bind((host.as_str(), port))
                    .await
                    .map_err(|e| {
                        RpcError::transport_closed(format!("cannot bind {}: {}", uri, e))
                    })?;
                Ok(Listener::Ws(listener))
            }
            Scheme::Loopback => Ok(Listener::Loopback(LoopbackListener::bind(
                uri.loopback_id(),
            )?)),
            Scheme::Bus => Err(RpcError::invalid_arguments(
                "servers cannot listen on bus URIs directly",
            )),
        }
    }

    pub async fn accept(&self) -> Result<Transport> {
        match self {
            Listener::Unix(listener, _) => {
                let (stream, _) = listener.accept().await.map_err(|e| {
                    RpcError::transport_closed(format!("accept failed: {}", e))
                })?;
                Ok(Transport::Unix(UnixTransport::new(stream)))
            }
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(|e| {
                    RpcError::transport_closed(format!("accept failed: {}", e))
                })?;
                Ok(Transport::Tcp(TcpTransport::new(stream, addr.to_string())))
            }
            Listener::Ws(listener) => {
                let (stream, addr) = listener.accept().await.map_err(|e| {
                    RpcError::transport_closed(format!("accept failed: {}", e))
                })?;
                Ok(Transport::WebSocket(
                    WebSocketTransport::accept(stream, addr.to_string()).await?,
                ))
            }
            Listener::Loopback(listener) => listener.accept().await.map(Transport::Loopback),
        }
    }

    /// The bound address, with ephemeral ports resolved.
    pub fn local_uri(&self) -> String {
        match self {
            Listener::Unix(_, path) => format!("unix://{}", path),
            Listener::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => format!("tcp://{}", addr),
                Err(_) => "tcp://?".to_owned(),
            },
            Listener::Ws(listener) => match listener.local_addr() {
                Ok(addr) => format!("ws://{}", addr),
                Err(_) => "ws://?".to_owned(),
            },
            Listener::Loopback(listener) => format!("loopback://{}", listener.id()),
        }
    }
}
