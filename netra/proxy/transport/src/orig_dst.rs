use super::TransportError;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Recovers the pre-NAT destination of a diverted connection.
///
/// Abstracted so tests (and non-Linux builds) can substitute a fixed
/// address for the packet-filter lookup.
pub trait OrigDstAddr: Clone + Send + Sync + 'static {
    fn orig_dst_addr(&self, sock: &TcpStream) -> Result<SocketAddr, TransportError>;
}

/// Reads `SO_ORIGINAL_DST` from the socket.
#[derive(Copy, Clone, Debug, Default)]
pub struct GetOrigDstAddr(());

impl OrigDstAddr for GetOrigDstAddr {
    #[cfg(target_os = "linux")]
    fn orig_dst_addr(&self, sock: &TcpStream) -> Result<SocketAddr, TransportError> {
        linux::orig_dst_addr(sock).map_err(TransportError::Resolve)
    }

    #[cfg(not(target_os = "linux"))]
    fn orig_dst_addr(&self, _: &TcpStream) -> Result<SocketAddr, TransportError> {
        Err(TransportError::Resolve(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "SO_ORIGINAL_DST is only available on Linux",
        )))
    }
}

#[cfg(any(test, feature = "mock-orig-dst"))]
mod mock {
    use super::*;

    /// Returns a fixed address instead of querying the packet filter.
    #[derive(Copy, Clone, Debug)]
    pub struct FixedOrigDstAddr(pub SocketAddr);

    impl OrigDstAddr for FixedOrigDstAddr {
        fn orig_dst_addr(&self, _: &TcpStream) -> Result<SocketAddr, TransportError> {
            Ok(self.0)
        }
    }
}

#[cfg(any(test, feature = "mock-orig-dst"))]
pub use self::mock::FixedOrigDstAddr;

#[cfg(target_os = "linux")]
mod linux {
    use std::os::unix::io::AsRawFd;
    use std::{io, mem, net::SocketAddr};
    use tokio::net::TcpStream;

    // Defined by netfilter; not exported by libc.
    const SO_ORIGINAL_DST: libc::c_int = 80;

    pub(super) fn orig_dst_addr(sock: &TcpStream) -> io::Result<SocketAddr> {
        let fd = sock.as_raw_fd();
        unsafe {
            let mut sockaddr: libc::sockaddr_in = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let ret = libc::getsockopt(
                fd,
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                &mut sockaddr as *mut _ as *mut libc::c_void,
                &mut len as *mut _,
            );
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
            mk_addr(&sockaddr)
        }
    }

    // The kernel hands back a `sockaddr_in`: port in network order at bytes
    // 2-3, the IPv4 address at bytes 4-7.
    fn mk_addr(sockaddr: &libc::sockaddr_in) -> io::Result<SocketAddr> {
        if libc::c_int::from(sockaddr.sin_family) != libc::AF_INET {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "original destination is not IPv4",
            ));
        }
        let ip = std::net::Ipv4Addr::from(u32::from_be(sockaddr.sin_addr.s_addr));
        let port = u16::from_be(sockaddr.sin_port);
        Ok(SocketAddr::new(ip.into(), port))
    }
}
