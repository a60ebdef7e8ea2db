#![deny(warnings, rust_2018_idioms)]

//! Configures and runs the proxy.
//!
//! The accept loop hands each diverted connection to a worker that
//! recovers the original destination, classifies direction and protocol,
//! and drives either the HTTP interceptor or the raw TCP forwarder.

mod config;

pub use self::config::{Config, ConfigError, Env, Protocol, Strings};

use netra_addr::Addr;
use netra_error::Error;
use netra_estab::EstablishedSet;
use netra_io::BufferPool;
use netra_metrics::{NoMetrics, SharedSink, Statsd};
use netra_proxy_http::ConnectionCtx;
use netra_proxy_transport::{self as transport, OrigDstAddr};
use netra_trace::{Bridge, TracerProvider};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, Instrument};

const ESTAB_DUMP_INTERVAL: Duration = Duration::from_secs(5);

/// A running proxy bound to its listener.
pub struct App<G> {
    listener: TcpListener,
    server: Arc<Server<G>>,
}

/// Everything a connection worker needs, shared across workers.
struct Server<G> {
    config: Config,
    orig_dst: G,
    http: netra_proxy_http::Proxy,
    metrics: SharedSink,
    estab: EstablishedSet,
    pool: BufferPool,
}

// === impl App ===

impl<G: OrigDstAddr> App<G> {
    /// Builds the runtime wiring and binds the listener. Bind and StatsD
    /// socket failures here are fatal to startup.
    pub async fn bind(
        config: Config,
        provider: &TracerProvider,
        orig_dst: G,
    ) -> Result<App<G>, Error> {
        let metrics: SharedSink = match (config.statsd_enabled, config.statsd_address.as_deref()) {
            (true, Some(address)) => Arc::new(Statsd::new(address, &config.statsd_prefix)?),
            _ => NoMetrics::shared(),
        };

        let contexts = netra_cache::ExpiringCache::spawn(
            config.tracing_context_expiration,
            config.tracing_context_cleanup_interval,
        );
        let routes = netra_cache::ExpiringCache::spawn(
            config.routing_context_expiration,
            config.routing_context_cleanup_interval,
        );
        let bridge = Bridge::new(
            provider,
            contexts,
            config.tag_maps.clone(),
            config.tracing_ignored_paths.clone(),
        );
        let http = netra_proxy_http::Proxy::new(
            config.http.clone(),
            Arc::new(bridge),
            routes,
            metrics.clone(),
        );

        let listener = transport::bind(config.proxy_port).await?;
        info!(addr = %listener.local_addr()?, "Proxy listening");

        Ok(App {
            listener,
            server: Arc::new(Server {
                config,
                orig_dst,
                http,
                metrics,
                estab: EstablishedSet::new(),
                pool: BufferPool::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever. Accept errors are logged and the loop
    /// continues; nothing here terminates the process.
    pub async fn run(self) -> Result<(), Error> {
        self.server.estab.spawn_dump(ESTAB_DUMP_INTERVAL);
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.server.clone();
                    tokio::spawn(
                        async move { server.handle(stream, peer).await }
                            .instrument(info_span!("conn", %peer)),
                    );
                }
                Err(error) => {
                    error!(%error, "Failed to accept");
                }
            }
        }
    }
}

// === impl Server ===

impl<G: OrigDstAddr> Server<G> {
    /// Drives one diverted connection to completion. Every failure here is
    /// fatal to this connection only: the sockets are dropped and the
    /// worker exits.
    async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) {
        // The pre-NAT destination the client was actually dialing.
        let orig_dst = match self.orig_dst.orig_dst_addr(&stream) {
            Ok(addr) => addr,
            Err(error) => {
                debug!(%error, "Dropping connection");
                return;
            }
        };
        let local_ip = match stream.local_addr() {
            Ok(addr) => addr.ip(),
            Err(error) => {
                debug!(%error, "Dropping connection");
                return;
            }
        };
        // Diverted on ingress iff the client was dialing this host.
        let is_inbound = orig_dst.ip() == local_ip;
        let _ = stream.set_nodelay(true);

        let protocol = self.config.classify(orig_dst.port());
        debug!(%orig_dst, is_inbound, ?protocol, "Proxying");

        let dst_label = orig_dst.to_string();
        self.estab.add(&dst_label);
        let result = match protocol {
            Protocol::Http => {
                self.metrics.incr("conn.http");
                let ctx = ConnectionCtx {
                    orig_dst,
                    peer,
                    is_inbound,
                };
                self.http.serve(stream, ctx).await
            }
            Protocol::Tcp => {
                self.metrics.incr("conn.tcp");
                self.forward_tcp(&mut stream, orig_dst).await
            }
        };
        self.estab.remove(&dst_label);

        if let Err(error) = result {
            debug!(%error, "Connection closed");
        }
    }

    async fn forward_tcp(&self, src: &mut TcpStream, orig_dst: SocketAddr) -> Result<(), Error> {
        let mut dst = transport::connect(&Addr::Socket(orig_dst)).await?;
        netra_proxy_tcp::forward(src, &mut dst, &self.pool).await?;
        Ok(())
    }
}
