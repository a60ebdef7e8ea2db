#![deny(warnings, rust_2018_idioms)]

//! Streaming interception for HTTP/1.x connections.
//!
//! Each proxied connection runs two loops: the request direction parses
//! heads, injects correlation headers, and forwards; the response direction
//! forwards heads and bodies back and closes spans. Anything that fails to
//! parse degrades to byte-for-byte raw forwarding, so a misclassified port
//! never corrupts a stream.

mod body;
mod head;
mod reader;
mod request;
mod response;
mod route;
mod state;

pub use self::head::{BodyKind, Header, Headers, ParseError, RequestHead, ResponseHead};
pub use self::reader::{ReadHead, Reader, SNIFF_CAPACITY};

use self::request::Upstream;
use self::state::ConnState;
use netra_addr::Addr;
use netra_cache::ExpiringCache;
use netra_error::Error;
use netra_io::{AsyncRead, AsyncWrite, BufferPool};
use netra_metrics::SharedSink;
use netra_trace::Bridge;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

/// Header names and routing knobs for the interceptor.
#[derive(Clone, Debug)]
pub struct Config {
    pub request_id_header: String,
    pub source_header: String,
    pub source_value: String,
    pub routing_enabled: bool,
    pub routing_header: String,
    pub routing_cookie_enabled: bool,
    pub routing_cookie: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_id_header: "X-Request-Id".to_string(),
            source_header: "X-Source".to_string(),
            source_value: "netra".to_string(),
            routing_enabled: false,
            routing_header: "X-Route".to_string(),
            routing_cookie_enabled: false,
            routing_cookie: "NETRA-ROUTE".to_string(),
        }
    }
}

/// What the pipe engine knows about an accepted connection.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionCtx {
    /// The pre-NAT destination recovered from the diverted socket.
    pub orig_dst: SocketAddr,
    /// The downstream peer, for span tagging.
    pub peer: SocketAddr,
    /// Whether the flow enters the local service.
    pub is_inbound: bool,
}

/// The shared HTTP interception environment: one per process, used by
/// every HTTP-classified connection.
pub struct Proxy {
    config: Config,
    bridge: Arc<Bridge>,
    /// request-id → raw routing value, so ingress routing follows the
    /// request's downstream calls.
    routes: ExpiringCache<String>,
    metrics: SharedSink,
    pool: BufferPool,
}

// === impl Proxy ===

impl Proxy {
    pub fn new(
        config: Config,
        bridge: Arc<Bridge>,
        routes: ExpiringCache<String>,
        metrics: SharedSink,
    ) -> Self {
        Self {
            config,
            bridge,
            routes,
            metrics,
            pool: BufferPool::new(),
        }
    }

    /// Proxies one HTTP-classified connection to completion.
    ///
    /// With routing disabled the original destination is dialed up front;
    /// with routing enabled the dial waits for the first request head. A
    /// failed dial is fatal to this connection only.
    pub async fn serve<I>(&self, io: I, ctx: ConnectionCtx) -> Result<(), Error>
    where
        I: AsyncRead + AsyncWrite,
    {
        let (src_r, src_w) = tokio::io::split(io);
        let state = ConnState::new(ctx.peer);

        if self.config.routing_enabled {
            let (reader_tx, reader_rx) = oneshot::channel();
            let request = request::serve(
                self,
                &ctx,
                Reader::new(src_r),
                Upstream::deferred(reader_tx),
                &state,
            );
            let response = async {
                match reader_rx.await {
                    Ok(dst_r) => response::serve(self, Reader::new(dst_r), src_w, &state).await,
                    // The downstream closed before the first request head;
                    // nothing was ever dialed.
                    Err(_) => Ok(()),
                }
            };
            self.drive(request, response, &state).await
        } else {
            let dst = netra_proxy_transport::connect(&Addr::Socket(ctx.orig_dst)).await?;
            let (dst_r, dst_w) = dst.into_split();
            let request = request::serve(
                self,
                &ctx,
                Reader::new(src_r),
                Upstream::ready(dst_w),
                &state,
            );
            let response = response::serve(self, Reader::new(dst_r), src_w, &state);
            self.drive(request, response, &state).await
        }
    }

    /// Runs both direction loops; whichever finishes first ends the
    /// connection. Dropping the loser closes its stream halves, and any
    /// request still waiting for a response has its span closed as timed
    /// out.
    async fn drive<A, B>(&self, request: A, response: B, state: &ConnState) -> Result<(), Error>
    where
        A: std::future::Future<Output = Result<(), Error>>,
        B: std::future::Future<Output = Result<(), Error>>,
    {
        tokio::pin!(request, response);
        let res = tokio::select! {
            res = &mut request => res,
            res = &mut response => res,
        };
        if let Err(error) = &res {
            warn!(%error, "Connection failed");
        }
        state.drain(&self.metrics);
        res
    }
}
