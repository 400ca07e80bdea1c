//! An owning, non-blocking TCP socket fd wrapper.
//!
//! Construction and option-setting go through `socket2`, the same crate
//! mio's own `net::TcpStream` builds on; the accept/bind/listen
//! sequencing and `SHUT_WR` half-close are raw `libc` calls, matching
//! mio's own avoidance of blocking `std::net::TcpStream` in its `sys`
//! layer in favor of direct syscalls it can make non-blocking.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use socket2::{Domain, Protocol, Socket as Socket2, Type};

use crate::address::InetAddress;

pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a non-blocking, close-on-exec IPv4 TCP socket.
    pub fn new_tcp() -> io::Result<Socket> {
        let sock = Socket2::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_nonblocking(true)?;
        sock.set_cloexec(true)?;
        Ok(Socket {
            fd: unsafe { OwnedFd::from_raw_fd(sock.into_raw_fd()) },
        })
    }

    pub fn from_raw_fd(fd: RawFd) -> Socket {
        Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.as_socket2().set_reuse_address(on)
    }

    /// Always set unconditionally by `Acceptor`, independent of the
    /// embedder's `reuse_port` flag — see the crate's design notes for
    /// why `SO_REUSEADDR` and `SO_REUSEPORT` are treated differently
    /// here than in the historical source this was modeled on.
    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.as_socket2().set_reuse_port(on)
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        self.as_socket2().set_nodelay(on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.as_socket2().set_keepalive(on)
    }

    pub fn bind(&self, addr: InetAddress) -> io::Result<()> {
        self.as_socket2().bind(&addr.to_sockaddr_v4().into())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.as_socket2().listen(backlog)
    }

    pub fn local_addr(&self) -> io::Result<InetAddress> {
        let addr = self.as_socket2().local_addr()?;
        addr_to_inet(addr)
    }

    /// Accepts one pending connection, returning a non-blocking,
    /// close-on-exec client socket and its peer address. Returns
    /// `Ok(None)` on `EWOULDBLOCK`/`EAGAIN`.
    pub fn accept(&self) -> io::Result<Option<(Socket, InetAddress)>> {
        let mut raw_addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        let fd = unsafe {
            libc::accept4(
                self.fd.as_raw_fd(),
                &mut raw_addr as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            };
        }

        Ok(Some((Socket::from_raw_fd(fd), InetAddress::from_raw(&raw_addr))))
    }

    /// Half-closes the write side: `shutdown(SHUT_WR)`. The peer still
    /// sees a normal read-side close, but this socket can keep reading
    /// until the peer closes its own write side.
    pub fn shutdown_write(&self) -> io::Result<()> {
        let ret = unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_WR) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Already shut down is not an error worth surfacing: the
            // connection state machine treats double-close as benign.
            if err.raw_os_error() == Some(libc::ENOTCONN) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn as_socket2(&self) -> socket2::SockRef<'_> {
        socket2::SockRef::from(&self.fd)
    }
}

fn addr_to_inet(addr: socket2::SockAddr) -> io::Result<InetAddress> {
    match addr.as_socket() {
        Some(std::net::SocketAddr::V4(v4)) => Ok(InetAddress::with_ip(&v4.ip().to_string(), v4.port())
            .unwrap_or_else(|_| InetAddress::new(v4.port()))),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "expected an IPv4 socket address",
        )),
    }
}
