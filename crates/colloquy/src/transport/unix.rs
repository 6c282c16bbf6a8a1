//! Unix domain socket transport with descriptor passing.
//!
//! Framing matches the TCP transport (`[body_len u32 LE][nfds u32 LE][body]`),
//! but descriptors travel as `SCM_RIGHTS` control messages attached to the
//! first `sendmsg` of the frame. The kernel delivers them with whichever
//! segment they rode in on; the receiver queues incoming descriptors and
//! hands out `nfds` of them with each completed frame.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::error::{Result, RpcError};
use crate::transport::{PeerCred, TransportBackend, WireFrame};
use crate::transport::tcp::{FRAME_HEADER_LEN, MAX_FRAME_LEN};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Clone)]
pub struct UnixTransport {
    inner: Arc<UnixInner>,
}

struct UnixInner {
    stream: UnixStream,
    send: Mutex<()>,
    recv: Mutex<RecvState>,
    closed: AtomicBool,
    peer: String,
}

struct RecvState {
    buf: BytesMut,
    fds: VecDeque<OwnedFd>,
}

impl UnixTransport {
    pub fn new(stream: UnixStream) -> Self {
        let peer = stream
            .peer_addr()
            .ok()
            .and_then(|a| a.as_pathname().map(|p| format!("unix://{}", p.display())))
            .unwrap_or_else(|| "unix://<unnamed>".to_owned());
        UnixTransport {
            inner: Arc::new(UnixInner {
                stream,
                send: Mutex::new(()),
                recv: Mutex::new(RecvState {
                    buf: BytesMut::new(),
                    fds: VecDeque::new(),
                }),
                closed: AtomicBool::new(false),
                peer,
            }),
        }
    }

    pub async fn connect(path: &str) -> Result<UnixTransport> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            RpcError::transport_closed(format!("cannot connect to unix://{}: {}", path, e))
        })?;
        Ok(Self::new(stream))
    }

    pub fn peer_cred(&self) -> Option<PeerCred> {
        let cred = self.inner.stream.peer_cred().ok()?;
        Some(PeerCred {
            pid: cred.pid(),
            uid: cred.uid(),
            gid: cred.gid(),
        })
    }

    fn fail_closed(&self, context: &str, err: io::Error) -> RpcError {
        self.inner.closed.store(true, Ordering::Release);
        RpcError::transport_closed(format!("{}: {}", context, err))
    }
}

impl TransportBackend for UnixTransport {
    async fn send(&self, frame: WireFrame) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::transport_closed("unix endpoint is closed"));
        }

        let mut msg = BytesMut::with_capacity(FRAME_HEADER_LEN + frame.body.len());
        msg.put_u32_le(frame.body.len() as u32);
        msg.put_u32_le(frame.fds.len() as u32);
        msg.extend_from_slice(&frame.body);

        let raw_fds: Vec<RawFd> = frame.fds.iter().map(|fd| fd.as_raw_fd()).collect();

        let _guard = self.inner.send.lock().await;
        let mut offset = 0usize;
        while offset < msg.len() {
            // Control messages ride with the first byte of the frame.
            let fds = if offset == 0 { &raw_fds[..] } else { &[][..] };
            let n = self
                .inner
                .stream
                .async_io(Interest::WRITABLE, || {
                    send_with_fds(self.inner.stream.as_raw_fd(), &msg[offset..], fds)
                })
                .await
                .map_err(|e| self.fail_closed("unix send failed", e))?;
            offset += n;
        }
        // frame.fds drops here, closing the duplicates made for this frame.
        Ok(())
    }

    async fn recv(&self) -> Result<WireFrame> {
        if self.is_closed() {
            return Err(RpcError::transport_closed("unix endpoint is closed"));
        }

        let mut state = self.inner.recv.lock().await;
        loop {
            if state.buf.len() >= FRAME_HEADER_LEN {
                let body_len =
                    u32::from_le_bytes(state.buf[0..4].try_into().unwrap()) as usize;
                let nfds = u32::from_le_bytes(state.buf[4..8].try_into().unwrap()) as usize;
                if body_len > MAX_FRAME_LEN {
                    self.inner.closed.store(true, Ordering::Release);
                    return Err(RpcError::transport_closed(format!(
                        "unix frame of {} bytes exceeds the frame limit",
                        body_len
                    )));
                }
                if state.buf.len() >= FRAME_HEADER_LEN + body_len && state.fds.len() >= nfds {
                    state.buf.advance(FRAME_HEADER_LEN);
                    let body = state.buf.split_to(body_len).freeze();
                    let fds = state.fds.drain(..nfds).collect();
                    return Ok(WireFrame { body, fds });
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let (n, fds) = self
                .inner
                .stream
                .async_io(Interest::READABLE, || {
                    recv_with_fds(self.inner.stream.as_raw_fd(), &mut chunk)
                })
                .await
                .map_err(|e| self.fail_closed("unix recv failed", e))?;
            if n == 0 {
                self.inner.closed.store(true, Ordering::Release);
                return Err(RpcError::transport_closed("unix peer closed the socket"));
            }
            state.buf.extend_from_slice(&chunk[..n]);
            state.fds.extend(fds);
        }
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn supports_fd_passing(&self) -> bool {
        true
    }

    fn peer_label(&self) -> String {
        self.inner.peer.clone()
    }
}

fn send_with_fds(sock: RawFd, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        let mut cmsg_buf: Vec<u8> = Vec::new();
        if !fds.is_empty() {
            let payload_len = std::mem::size_of_val(fds);
            let space = libc::CMSG_SPACE(payload_len as u32) as usize;
            cmsg_buf = vec![0u8; space];
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = space as _;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload_len as u32) as _;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr() as *const u8,
                libc::CMSG_DATA(cmsg),
                payload_len,
            );
        }

        let n = libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

fn recv_with_fds(sock: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // Room for a generous number of descriptors per segment.
        let mut cmsg_buf = [0u8; 1024];
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len() as _;

        let n = libc::recvmsg(sock, &mut msg, libc::MSG_CMSG_CLOEXEC);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut fds = Vec::new();
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = payload_len / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    let raw = std::ptr::read_unaligned(data.add(i));
                    // SAFETY: the kernel just handed us this descriptor.
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        Ok((n as usize, fds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::{Read, Seek, SeekFrom, Write};

    async fn unix_pair() -> (UnixTransport, UnixTransport) {
        let (a, b) = UnixStream::pair().unwrap();
        (UnixTransport::new(a), UnixTransport::new(b))
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (client, server) = unix_pair().await;

        client
            .send(WireFrame {
                body: Bytes::from_static(b"over unix"),
                fds: Vec::new(),
            })
            .await
            .unwrap();

        let frame = server.recv().await.unwrap();
        assert_eq!(&frame.body[..], b"over unix");
        assert!(frame.fds.is_empty());
    }

    #[tokio::test]
    async fn descriptor_crosses_the_socket() {
        let (client, server) = unix_pair().await;

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"carried").unwrap();
        file.flush().unwrap();

        client
            .send(WireFrame {
                body: Bytes::from_static(b"take this"),
                fds: vec![OwnedFd::from(file)],
            })
            .await
            .unwrap();

        let frame = server.recv().await.unwrap();
        assert_eq!(frame.fds.len(), 1);

        let mut received = std::fs::File::from(frame.fds.into_iter().next().unwrap());
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "carried");
    }

    #[tokio::test]
    async fn interleaved_frames_keep_descriptor_order() {
        let (client, server) = unix_pair().await;

        let mut one = tempfile::tempfile().unwrap();
        one.write_all(b"1").unwrap();
        let mut two = tempfile::tempfile().unwrap();
        two.write_all(b"2").unwrap();

        client
            .send(WireFrame {
                body: Bytes::from_static(b"first"),
                fds: vec![OwnedFd::from(one)],
            })
            .await
            .unwrap();
        client
            .send(WireFrame {
                body: Bytes::from_static(b"second"),
                fds: vec![OwnedFd::from(two)],
            })
            .await
            .unwrap();

        let first = server.recv().await.unwrap();
        let second = server.recv().await.unwrap();
        assert_eq!(&first.body[..], b"first");
        assert_eq!(first.fds.len(), 1);
        assert_eq!(&second.body[..], b"second");
        assert_eq!(second.fds.len(), 1);

        let mut contents = String::new();
        let mut file = std::fs::File::from(second.fds.into_iter().next().unwrap());
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "2");
    }

    #[tokio::test]
    async fn peer_close_fails_recv() {
        let (client, server) = unix_pair().await;
        drop(client);

        let err = server.recv().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TransportClosed);
    }
}
