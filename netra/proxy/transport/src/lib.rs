#![deny(warnings, rust_2018_idioms)]

mod orig_dst;

pub use self::orig_dst::{GetOrigDstAddr, OrigDstAddr};

#[cfg(any(test, feature = "mock-orig-dst"))]
pub use self::orig_dst::FixedOrigDstAddr;

use netra_addr::Addr;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The pre-NAT destination could not be read from the diverted socket.
    #[error("failed to recover original destination: {0}")]
    Resolve(#[source] io::Error),

    /// The upstream could not be dialed.
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: Addr,
        #[source]
        source: io::Error,
    },
}

/// Binds the proxy listener.
pub async fn bind(port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    debug!(addr = %listener.local_addr()?, "Bound");
    Ok(listener)
}

/// Dials `addr`, resolving names through the system resolver, and disables
/// Nagle on the resulting stream.
pub async fn connect(addr: &Addr) -> Result<TcpStream, TransportError> {
    let stream = match addr {
        Addr::Socket(sa) => TcpStream::connect(sa).await,
        Addr::Name(na) => TcpStream::connect((na.name(), na.port())).await,
    }
    .map_err(|source| TransportError::Dial {
        addr: addr.clone(),
        source,
    })?;
    let _ = stream.set_nodelay(true);
    debug!(%addr, "Connected");
    Ok(stream)
}
