//! IPv4 endpoint wrapper used across `Socket`, `Acceptor`, and
//! `TcpConnection`.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// An immutable IPv4 socket endpoint.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct InetAddress {
    addr: SocketAddrV4,
}

impl InetAddress {
    /// Builds an address for `0.0.0.0:port`, i.e. "listen on every
    /// interface".
    pub fn new(port: u16) -> Self {
        InetAddress {
            addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port),
        }
    }

    /// Builds an address from a dotted-quad string and a port.
    pub fn with_ip(ip: &str, port: u16) -> Result<Self, InvalidAddress> {
        let ip: Ipv4Addr = ip.parse().map_err(|_| InvalidAddress)?;
        Ok(InetAddress {
            addr: SocketAddrV4::new(ip, port),
        })
    }

    pub fn loopback(port: u16) -> Self {
        InetAddress {
            addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
        }
    }

    /// Builds from a raw `sockaddr_in` as handed back by `accept4`/
    /// `getpeername`.
    pub fn from_raw(raw: &libc::sockaddr_in) -> Self {
        let ip = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
        let port = u16::from_be(raw.sin_port);
        InetAddress {
            addr: SocketAddrV4::new(ip, port),
        }
    }

    pub fn to_sockaddr_v4(self) -> SocketAddrV4 {
        self.addr
    }

    pub fn port(self) -> u16 {
        self.addr.port()
    }

    pub fn ip(self) -> Ipv4Addr {
        *self.addr.ip()
    }
}

impl From<InetAddress> for SocketAddr {
    fn from(a: InetAddress) -> SocketAddr {
        SocketAddr::V4(a.addr)
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr.ip(), self.addr.port())
    }
}

impl fmt::Debug for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InetAddress({self})")
    }
}

/// A minimal error for a malformed dotted-quad string; this crate never
/// resolves hostnames, so there is exactly one way `with_ip` can fail.
#[derive(Debug)]
pub struct InvalidAddress;

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not a valid IPv4 dotted-quad address")
    }
}

impl std::error::Error for InvalidAddress {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_as_ip_colon_port() {
        let a = InetAddress::with_ip("127.0.0.1", 9090).unwrap();
        assert_eq!(a.to_string(), "127.0.0.1:9090");
    }

    #[test]
    fn new_binds_any_interface() {
        let a = InetAddress::new(0);
        assert_eq!(a.ip(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn from_raw_reads_network_byte_order() {
        let raw = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 8080u16.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(Ipv4Addr::new(10, 0, 0, 1)).to_be(),
            },
            sin_zero: [0; 8],
        };
        let a = InetAddress::from_raw(&raw);
        assert_eq!(a.port(), 8080);
        assert_eq!(a.ip(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn rejects_malformed_dotted_quad() {
        assert!(InetAddress::with_ip("not-an-ip", 80).is_err());
    }
}
