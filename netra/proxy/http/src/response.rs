use crate::reader::{ReadHead, Reader};
use crate::state::{ConnState, ResponseMeta};
use crate::{body, Proxy};
use netra_error::Error;
use netra_io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// The response direction: parse each head, forward it and its body to the
/// downstream verbatim, and finish the matching span. Runs until the
/// upstream closes (draining unanswered spans), the stream degrades to raw
/// copy, or an I/O error tears the connection down.
///
/// Responses are never mutated, so the raw head bytes are forwarded as
/// read.
pub(crate) async fn serve<R, W>(
    proxy: &Proxy,
    mut rd: Reader<R>,
    mut w: W,
    state: &ConnState,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let (head, raw) = match rd.read_response_head().await? {
            ReadHead::Eof => {
                trace!(in_flight = state.in_flight(), "Upstream closed");
                state.drain(&proxy.metrics);
                return Ok(());
            }
            ReadHead::Fallback(error) => {
                debug!(%error, "Response not parseable; falling back to raw forwarding");
                proxy.metrics.incr("http.fallback");
                body::forward_until_eof(&mut rd, &mut w, &proxy.pool).await?;
                state.drain(&proxy.metrics);
                return Ok(());
            }
            ReadHead::Head { head, raw } => (head, raw),
        };

        if head.is_upgrade() {
            debug!("Upgrade accepted; passing through");
            w.write_all(&raw).await?;
            body::forward_until_eof(&mut rd, &mut w, &proxy.pool).await?;
            return Ok(());
        }

        let kind = match head.body_kind() {
            Ok(kind) => kind,
            Err(error) => {
                debug!(%error, "Unframeable response body; falling back");
                proxy.metrics.incr("http.fallback");
                w.write_all(&raw).await?;
                body::forward_until_eof(&mut rd, &mut w, &proxy.pool).await?;
                state.drain(&proxy.metrics);
                return Ok(());
            }
        };

        w.write_all(&raw).await?;
        let response_size = body::stream(&mut rd, &mut w, kind, &proxy.pool).await?;

        state.complete(
            ResponseMeta {
                status: head.status,
                response_size,
            },
            &proxy.metrics,
        );
    }
}
