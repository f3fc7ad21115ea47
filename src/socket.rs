//! An owning, move-only wrapper around a single OS socket descriptor.
//!
//! [`Handle`] is built on top of [`socket2::Socket`], which already gives us
//! exclusive ownership and guaranteed close-on-drop; what this module adds is
//! the narrow, `Result<_, ProxyError>`-returning surface the engine actually
//! needs (§4.2), plus the couple of options (`IP_TRANSPARENT`, pending
//! `SO_ERROR`) `socket2` leaves as raw `setsockopt`/`getsockopt` calls.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::addr::Address;
use crate::error::{ProxyError, Result};

/// What a non-blocking `connect()` looks like right after the call returns.
pub enum ConnectOutcome {
    /// The connection succeeded synchronously (rare, but possible for
    /// loopback destinations).
    Connected,
    /// The connection is in progress; wait for write-readiness and then
    /// check [`Handle::take_socket_error`].
    InProgress,
    /// The connection failed immediately.
    Failed(io::Error),
}

/// An owning handle to one socket descriptor.
///
/// There is no "sentinel, no descriptor" state represented directly: a
/// `Handle` always owns exactly one live descriptor for as long as it
/// exists. [`Handle::into_socket2`] is the only way to give up ownership
/// without closing, and consumes `self`, so the move-only contract is
/// enforced by the type system rather than by a runtime flag.
pub struct Handle {
    inner: Socket,
}

impl Handle {
    /// Create a new socket (`socket(2)`).
    pub fn new(domain: Domain, ty: Type, protocol: Option<Protocol>) -> Result<Handle> {
        let inner = Socket::new(domain, ty, protocol)
            .map_err(|e| ProxyError::system("could not create socket", e))?;
        Ok(Handle { inner })
    }

    /// Wrap an already-owned descriptor (used by `accept`).
    fn from_socket2(inner: Socket) -> Handle {
        Handle { inner }
    }

    pub fn bind(&self, addr: &Address) -> Result<()> {
        let sa: SocketAddr = (*addr).into();
        self.inner
            .bind(&SockAddr::from(sa))
            .map_err(|e| ProxyError::system(format!("could not bind to {addr}"), e))
    }

    /// Issue a non-blocking `connect()` and classify the immediate result.
    pub fn connect(&self, addr: &Address) -> ConnectOutcome {
        let sa: SocketAddr = (*addr).into();
        match self.inner.connect(&SockAddr::from(sa)) {
            Ok(()) => ConnectOutcome::Connected,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || is_in_progress(&e) => {
                ConnectOutcome::InProgress
            }
            Err(e) => ConnectOutcome::Failed(e),
        }
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        self.inner
            .listen(backlog)
            .map_err(|e| ProxyError::system("could not listen", e))
    }

    /// Accept the next pending inbound connection, returning the new handle
    /// and the client's address.
    pub fn accept(&self) -> Result<(Handle, Address)> {
        let (sock, sa) = self
            .inner
            .accept()
            .map_err(|e| ProxyError::system("could not accept()", e))?;
        let peer = sa
            .as_socket()
            .ok_or_else(|| ProxyError::InvalidAddress("accept() returned a non-IP peer".into()))?;
        Ok((Handle::from_socket2(sock), Address::from(peer)))
    }

    /// The address this socket is locally bound to. When called on a freshly
    /// accepted, transparently-redirected socket, this is the client's
    /// *original* destination rather than our own listen address.
    pub fn getsockname(&self) -> Result<Address> {
        let sa = self
            .inner
            .local_addr()
            .map_err(|e| ProxyError::system("could not getsockname()", e))?;
        let sock_addr = sa
            .as_socket()
            .ok_or_else(|| ProxyError::InvalidAddress("getsockname() returned a non-IP address".into()))?;
        Ok(Address::from(sock_addr))
    }

    pub fn getpeername(&self) -> Result<Address> {
        let sa = self
            .inner
            .peer_addr()
            .map_err(|e| ProxyError::system("could not getpeername()", e))?;
        let sock_addr = sa
            .as_socket()
            .ok_or_else(|| ProxyError::InvalidAddress("getpeername() returned a non-IP address".into()))?;
        Ok(Address::from(sock_addr))
    }

    /// Read up to `max_len` bytes. An empty `Vec` means end-of-stream.
    pub fn recv(&self, max_len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max_len];
        let spare = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<std::mem::MaybeUninit<u8>>(), buf.len())
        };
        let n = self
            .inner
            .recv(spare)
            .map_err(|e| ProxyError::system("could not recv()", e))?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write as much of `data` as the kernel will currently accept. The
    /// caller is responsible for retrying any unwritten remainder.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.inner
            .send(data)
            .map_err(|e| ProxyError::system("could not send()", e))
    }

    pub fn shutdown(&self, how: std::net::Shutdown) -> Result<()> {
        self.inner
            .shutdown(how)
            .map_err(|e| ProxyError::system("could not shutdown()", e))
    }

    /// Read and clear the socket's pending error (`SO_ERROR`). Used right
    /// after a non-blocking `connect()` becomes writable, to learn whether
    /// it actually succeeded.
    pub fn take_socket_error(&self) -> Result<Option<io::Error>> {
        self.inner
            .take_error()
            .map_err(|e| ProxyError::system("could not getsockopt(SO_ERROR)", e))
    }

    pub fn set_reuseaddr(&self) -> Result<()> {
        self.inner
            .set_reuse_address(true)
            .map_err(|e| ProxyError::system("could not set SO_REUSEADDR", e))
    }

    /// Set `IP_TRANSPARENT`. Absence of kernel support is not an error: the
    /// proxy still runs, it just cannot intercept or spoof non-local
    /// addresses. Must be called before `bind()` (§4.2, §9).
    pub fn set_ip_transparent(&self) -> std::result::Result<(), io::Error> {
        let fd = self.inner.as_raw_fd();
        let value: libc::c_int = 1;
        let rv = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_TRANSPARENT,
                &value as *const _ as *const libc::c_void,
                std::mem::size_of_val(&value) as libc::socklen_t,
            )
        };
        if rv == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn set_non_blocking(&self, non_blocking: bool) -> Result<bool> {
        let prior = self.is_non_blocking()?;
        self.inner
            .set_nonblocking(non_blocking)
            .map_err(|e| ProxyError::system("could not set O_NONBLOCK", e))?;
        Ok(prior)
    }

    pub fn is_non_blocking(&self) -> Result<bool> {
        let fd = self.inner.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags == -1 {
            return Err(ProxyError::system("could not fcntl(F_GETFL)", io::Error::last_os_error()));
        }
        Ok(flags & libc::O_NONBLOCK != 0)
    }

    /// Give up ownership of the underlying [`socket2::Socket`] without
    /// closing it. Used to hand the descriptor to `mio` for registration.
    pub fn into_socket2(self) -> Socket {
        self.inner
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl IntoRawFd for Handle {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}

impl FromRawFd for Handle {
    unsafe fn from_raw_fd(fd: RawFd) -> Handle {
        Handle {
            inner: Socket::from_raw_fd(fd),
        }
    }
}

fn is_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn recv_reports_eof_as_empty() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        drop(server);

        let handle = unsafe { Handle::from_raw_fd(client.into_raw_fd()) };
        handle.set_non_blocking(true).unwrap();
        // Give the kernel a moment to observe the peer's close.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let data = handle.recv(4096).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn send_then_recv_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let client_handle = unsafe { Handle::from_raw_fd(client.into_raw_fd()) };
        let server_handle = unsafe { Handle::from_raw_fd(server.into_raw_fd()) };

        let n = client_handle.send(b"hello").unwrap();
        assert_eq!(n, 5);
        std::thread::sleep(std::time::Duration::from_millis(20));
        let data = server_handle.recv(4096).unwrap();
        assert_eq!(&data, b"hello");
    }
}
