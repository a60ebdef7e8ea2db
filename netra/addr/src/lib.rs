#![deny(warnings, rust_2018_idioms)]

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

/// A destination address: either a resolved socket address or a named host
/// with a port that still needs resolution at dial time.
///
/// Routing targets come off the wire as free-form `host[:port]` strings, so
/// they cannot be assumed to be IP literals.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Addr {
    Socket(SocketAddr),
    Name(NameAddr),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NameAddr {
    name: String,
    port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("address could not be parsed as a host and port")]
pub struct InvalidAddr(());

// === impl Addr ===

impl Addr {
    /// Parses `hostport`, using `default_port` when the string carries no
    /// port of its own.
    pub fn from_str_and_port(hostport: &str, default_port: u16) -> Result<Self, InvalidAddr> {
        if let Ok(sa) = SocketAddr::from_str(hostport) {
            return Ok(Addr::Socket(sa));
        }
        if let Ok(ip) = IpAddr::from_str(hostport) {
            return Ok(Addr::Socket(SocketAddr::new(ip, default_port)));
        }
        match hostport.rfind(':') {
            Some(idx) => {
                let (name, port) = hostport.split_at(idx);
                let port = port[1..].parse::<u16>().map_err(|_| InvalidAddr(()))?;
                NameAddr::new(name, port).map(Addr::Name)
            }
            None => NameAddr::new(hostport, default_port).map(Addr::Name),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Addr::Socket(sa) => sa.port(),
            Addr::Name(na) => na.port,
        }
    }
}

impl FromStr for Addr {
    type Err = InvalidAddr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match SocketAddr::from_str(s) {
            Ok(sa) => Ok(Addr::Socket(sa)),
            Err(_) => {
                let idx = s.rfind(':').ok_or(InvalidAddr(()))?;
                let (name, port) = s.split_at(idx);
                let port = port[1..].parse::<u16>().map_err(|_| InvalidAddr(()))?;
                NameAddr::new(name, port).map(Addr::Name)
            }
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Socket(sa) => sa.fmt(f),
            Addr::Name(na) => na.fmt(f),
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(sa: SocketAddr) -> Self {
        Addr::Socket(sa)
    }
}

// === impl NameAddr ===

impl NameAddr {
    pub fn new(name: &str, port: u16) -> Result<Self, InvalidAddr> {
        if name.is_empty() || name.contains(':') || name.contains('/') {
            return Err(InvalidAddr(()));
        }
        Ok(NameAddr {
            name: name.to_string(),
            port,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_socket_addrs() {
        assert_eq!(
            Addr::from_str_and_port("10.0.0.5:8080", 80).unwrap(),
            Addr::Socket(([10, 0, 0, 5], 8080).into())
        );
    }

    #[test]
    fn default_port_applies_to_bare_hosts() {
        match Addr::from_str_and_port("example.com", 80).unwrap() {
            Addr::Name(na) => {
                assert_eq!(na.name(), "example.com");
                assert_eq!(na.port(), 80);
            }
            addr => panic!("unexpected {:?}", addr),
        }
    }

    #[test]
    fn default_port_applies_to_bare_ips() {
        assert_eq!(
            Addr::from_str_and_port("10.0.0.5", 80).unwrap(),
            Addr::Socket(([10, 0, 0, 5], 80).into())
        );
    }

    #[test]
    fn explicit_port_wins() {
        match Addr::from_str_and_port("svc.cluster.local:9090", 80).unwrap() {
            Addr::Name(na) => assert_eq!(na.port(), 9090),
            addr => panic!("unexpected {:?}", addr),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(Addr::from_str_and_port("ex ample::", 80).is_err());
        assert!(Addr::from_str_and_port("host:notaport", 80).is_err());
    }
}
