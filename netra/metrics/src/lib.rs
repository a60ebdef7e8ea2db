#![deny(warnings, rust_2018_idioms)]

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A sink for proxy metrics.
///
/// Implementations must be thread-safe and must never block the data path;
/// delivery failures are dropped silently.
pub trait Sink: Send + Sync {
    fn incr(&self, name: &str);
    fn timing(&self, name: &str, elapsed: Duration);
}

pub type SharedSink = Arc<dyn Sink>;

/// A sink that discards everything. Used when StatsD is disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMetrics(());

/// A StatsD client over a connected, non-blocking UDP socket.
#[derive(Debug)]
pub struct Statsd {
    socket: UdpSocket,
    prefix: String,
}

// === impl NoMetrics ===

impl NoMetrics {
    pub fn shared() -> SharedSink {
        Arc::new(NoMetrics(()))
    }
}

impl Sink for NoMetrics {
    fn incr(&self, _: &str) {}
    fn timing(&self, _: &str, _: Duration) {}
}

// === impl Statsd ===

impl Statsd {
    pub fn new(address: &str, prefix: &str) -> std::io::Result<Statsd> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(address)?;
        socket.set_nonblocking(true)?;
        Ok(Statsd {
            socket,
            prefix: prefix.to_string(),
        })
    }

    fn send(&self, datagram: String) {
        // Metric loss is acceptable; a full socket buffer must not stall
        // the proxied connection.
        if let Err(e) = self.socket.send(datagram.as_bytes()) {
            debug!("Dropped metric: {}", e);
        }
    }
}

impl Sink for Statsd {
    fn incr(&self, name: &str) {
        self.send(format!("{}.{}:1|c", self.prefix, name));
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        self.send(format!("{}.{}:{}|ms", self.prefix, name, elapsed.as_millis()));
    }
}
