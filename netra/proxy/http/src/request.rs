use crate::head::RequestHead;
use crate::reader::{ReadHead, Reader};
use crate::state::{ConnState, RequestMeta};
use crate::{body, route, ConnectionCtx, Proxy};
use bytes::BytesMut;
use netra_addr::Addr;
use netra_error::Error;
use netra_io::{AsyncRead, AsyncWriteExt};
use netra_trace::Direction;
use std::time::Instant;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

/// The upstream half of a proxied connection.
///
/// With routing enabled nothing is dialed until the first request head has
/// been read; the response loop receives the upstream's read half over a
/// channel once the dial completes. If the downstream closes first, the
/// channel is simply dropped and no dial ever happens.
pub(crate) struct Upstream {
    writer: Option<OwnedWriteHalf>,
    pending: Option<oneshot::Sender<OwnedReadHalf>>,
}

// === impl Upstream ===

impl Upstream {
    pub(crate) fn ready(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: Some(writer),
            pending: None,
        }
    }

    pub(crate) fn deferred(reader_tx: oneshot::Sender<OwnedReadHalf>) -> Self {
        Self {
            writer: None,
            pending: Some(reader_tx),
        }
    }

    /// True until the first dial; the routing decision window.
    fn is_pending(&self) -> bool {
        self.writer.is_none()
    }

    /// Returns the upstream writer, dialing `addr` first if nothing has
    /// been dialed yet.
    async fn ensure(&mut self, addr: &Addr) -> Result<&mut OwnedWriteHalf, Error> {
        if self.writer.is_none() {
            let reader_tx = self
                .pending
                .take()
                .expect("deferred upstream consumed twice");
            let stream = netra_proxy_transport::connect(addr).await?;
            let (dst_r, dst_w) = stream.into_split();
            // The response loop may already be gone; that only means the
            // downstream is tearing down.
            let _ = reader_tx.send(dst_r);
            self.writer = Some(dst_w);
        }
        Ok(self.writer.as_mut().expect("writer was just installed"))
    }
}

/// The request direction: parse each head, mutate correlation headers,
/// start the span, and forward head and body upstream. Runs until the
/// downstream closes, the stream degrades to raw copy, or an I/O error
/// tears the connection down.
pub(crate) async fn serve<R>(
    proxy: &Proxy,
    ctx: &ConnectionCtx,
    mut rd: Reader<R>,
    mut upstream: Upstream,
    state: &ConnState,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    loop {
        let (mut head, raw) = match rd.read_request_head().await? {
            ReadHead::Eof => {
                trace!("Downstream closed");
                return Ok(());
            }
            ReadHead::Fallback(error) => {
                debug!(%error, "Request not parseable; falling back to raw forwarding");
                proxy.metrics.incr("http.fallback");
                let w = upstream.ensure(&Addr::Socket(ctx.orig_dst)).await?;
                body::forward_until_eof(&mut rd, w, &proxy.pool).await?;
                return Ok(());
            }
            ReadHead::Head { head, raw } => (head, raw),
        };

        // Upgraded connections are passed through untouched, current head
        // included.
        if head.is_upgrade() {
            debug!("Upgrade requested; passing through");
            let w = upstream.ensure(&Addr::Socket(ctx.orig_dst)).await?;
            w.write_all(&raw).await?;
            body::forward_until_eof(&mut rd, w, &proxy.pool).await?;
            return Ok(());
        }

        // A head whose framing headers are unusable cannot be streamed;
        // replay it verbatim and degrade, like any other parse failure.
        let body_kind = match head.body_kind() {
            Ok(kind) => kind,
            Err(error) => {
                debug!(%error, "Unframeable request body; falling back");
                proxy.metrics.incr("http.fallback");
                let w = upstream.ensure(&Addr::Socket(ctx.orig_dst)).await?;
                w.write_all(&raw).await?;
                body::forward_until_eof(&mut rd, w, &proxy.pool).await?;
                return Ok(());
            }
        };

        // Routing decision: first request of the connection only. A dial
        // failure is fatal to the connection.
        let addr = if upstream.is_pending() {
            route::decide(&proxy.config, &head, ctx.orig_dst)
        } else {
            Addr::Socket(ctx.orig_dst)
        };
        let w = upstream.ensure(&addr).await?;

        let start = Instant::now();
        let request_id = inject_request_id(proxy, &mut head);

        if !ctx.is_inbound {
            // Stitch this outbound call onto the inbound span that caused
            // it, when one is on record.
            if let Some(context) = proxy.bridge.stored_context(&request_id) {
                proxy.bridge.inject_context(context, &mut head.headers);
            }
            if head.headers.get(&proxy.config.source_header).is_none() {
                head.headers
                    .set(&proxy.config.source_header, &proxy.config.source_value);
            }
            // A route pinned at ingress follows the request downstream.
            if proxy.config.routing_enabled && route::routing_value(&proxy.config, &head).is_none()
            {
                if let Some(routes) = proxy.routes.get(&request_id) {
                    head.headers.set(&proxy.config.routing_header, &routes);
                }
            }
        }

        let span = start_span(proxy, ctx, &mut head, &request_id);

        let mut encoded = BytesMut::with_capacity(raw.len() + 128);
        head.encode_into(&mut encoded);
        w.write_all(&encoded).await?;
        let request_size = body::stream(&mut rd, w, body_kind, &proxy.pool).await?;

        state.push_request(
            RequestMeta {
                method: head.method.clone(),
                host: head.host().to_string(),
                path: head.path().to_string(),
                user_agent: head.user_agent().map(str::to_string),
                request_id,
                request_size,
                start,
            },
            span,
        );
        proxy.metrics.incr("http.requests");
    }
}

/// Ensures the request carries a request id, generating one if the peer
/// did not send one.
fn inject_request_id(proxy: &Proxy, head: &mut RequestHead) -> String {
    match head.headers.get_str(&proxy.config.request_id_header) {
        Some(v) => v.to_string(),
        None => {
            let id = Uuid::new_v4().to_string();
            head.headers.set(&proxy.config.request_id_header, &id);
            id
        }
    }
}

/// Starts the span for this request and performs the direction-specific
/// bookkeeping: inbound spans are recorded for correlation and tagged from
/// the configured maps, outbound spans are injected into the wire headers.
fn start_span(
    proxy: &Proxy,
    ctx: &ConnectionCtx,
    head: &mut RequestHead,
    request_id: &str,
) -> Option<netra_trace::RequestSpan> {
    if proxy.bridge.is_ignored(head.path()) {
        return None;
    }

    let (direction, operation) = if ctx.is_inbound {
        (Direction::Inbound, head.path().to_string())
    } else {
        (
            Direction::Outbound,
            format!("{}{}", head.host(), head.path()),
        )
    };
    let mut span = proxy.bridge.start_request(direction, operation, &head.headers);

    if ctx.is_inbound {
        proxy.bridge.store_context(request_id, span.context());
        let headers = &head.headers;
        proxy.bridge.apply_tag_maps(
            &mut span,
            |name| headers.get_str(name).map(str::to_string),
            |name| headers.cookie(name),
        );
        if proxy.config.routing_enabled {
            if let Some(routes) = route::routing_value(&proxy.config, head) {
                proxy.routes.insert(request_id.to_string(), routes);
            }
        }
    } else {
        proxy.bridge.inject_context(span.context(), &mut head.headers);
    }
    Some(span)
}
