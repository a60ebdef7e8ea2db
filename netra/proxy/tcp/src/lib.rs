#![deny(warnings, rust_2018_idioms)]

use netra_io::{copy_until_eof, AsyncWriteExt, BufferPool};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Forwards bytes between `src` and `dst` until both directions reach EOF
/// or either fails, returning (bytes sent upstream, bytes received).
///
/// Each direction propagates EOF by shutting down its write half, so a
/// half-closing peer still drains the opposite direction before teardown.
pub async fn forward(
    src: &mut TcpStream,
    dst: &mut TcpStream,
    pool: &BufferPool,
) -> std::io::Result<(u64, u64)> {
    let (mut src_r, mut src_w) = src.split();
    let (mut dst_r, mut dst_w) = dst.split();

    let request = async {
        let n = copy_until_eof(&mut src_r, &mut dst_w, pool).await?;
        trace!(bytes = n, "Request direction at EOF");
        dst_w.shutdown().await?;
        Ok::<u64, std::io::Error>(n)
    };
    let response = async {
        let n = copy_until_eof(&mut dst_r, &mut src_w, pool).await?;
        trace!(bytes = n, "Response direction at EOF");
        src_w.shutdown().await?;
        Ok::<u64, std::io::Error>(n)
    };

    let (sent, received) = tokio::try_join!(request, response)?;
    debug!(sent, received, "Forwarding complete");
    Ok((sent, received))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        (connect.await.unwrap(), accepted)
    }

    #[tokio::test]
    async fn forwards_both_directions() {
        let (mut client, mut proxy_src) = pair().await;
        let (mut proxy_dst, mut server) = pair().await;

        let pool = BufferPool::new();
        let relay =
            tokio::spawn(
                async move { forward(&mut proxy_src, &mut proxy_dst, &pool).await.unwrap() },
            );

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut got = [0u8; 4];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        server.write_all(b"pong").await.unwrap();
        server.shutdown().await.unwrap();

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"pong");

        let (sent, received) = relay.await.unwrap();
        assert_eq!(sent, 4);
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn large_transfers_round_trip() {
        let (mut client, mut proxy_src) = pair().await;
        let (mut proxy_dst, mut server) = pair().await;

        let pool = BufferPool::new();
        tokio::spawn(async move {
            let _ = forward(&mut proxy_src, &mut proxy_dst, &pool).await;
        });

        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got.len(), expected.len());
        assert_eq!(got, expected);
        writer.await.unwrap();
    }
}
