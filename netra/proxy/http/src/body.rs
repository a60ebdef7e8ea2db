use crate::head::BodyKind;
use crate::reader::Reader;
use netra_io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufferPool, PrefixedIo};
use std::io;

/// Chunk sizes longer than this many hex digits are rejected outright.
const MAX_HEX_DIGITS: usize = 15;

const HEX_TABLE: [u8; 256] = hex_table();

const fn hex_table() -> [u8; 256] {
    let mut table = [16u8; 256];
    let mut i = 0;
    while i < 256 {
        let c = i as u8;
        table[i] = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => 16,
        };
        i += 1;
    }
    table
}

/// Forwards one message body from `rd` to `w` using the framing implied by
/// the head, returning the number of payload bytes forwarded.
///
/// Framing violations mid-body are I/O errors (the stream is torn down),
/// not fallback: by this point both peers committed to HTTP.
pub async fn stream<R, W>(
    rd: &mut Reader<R>,
    w: &mut W,
    kind: BodyKind,
    pool: &BufferPool,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let n = match kind {
        BodyKind::Empty => 0,
        BodyKind::Fixed(n) => forward_exact(rd, w, n).await?,
        BodyKind::Chunked => forward_chunked(rd, w).await?,
        BodyKind::UntilEof => forward_until_eof(rd, w, pool).await?,
    };
    w.flush().await?;
    Ok(n)
}

/// Copies exactly `n` bytes of buffered-then-streamed payload.
async fn forward_exact<R, W>(rd: &mut Reader<R>, w: &mut W, n: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remain = n;
    while remain > 0 {
        if rd.buffer().is_empty() && rd.fill().await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let take = rd.buffer().len().min(remain as usize);
        w.write_all(&rd.buffer()[..take]).await?;
        rd.consume(take);
        remain -= take as u64;
    }
    Ok(n)
}

/// Copies whatever is buffered, then the rest of the stream until EOF.
///
/// This is also the fallback path: the sniffed prefix is replayed ahead of
/// the live stream, so the peer sees exactly the bytes the client sent.
pub(crate) async fn forward_until_eof<R, W>(
    rd: &mut Reader<R>,
    w: &mut W,
    pool: &BufferPool,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut io = PrefixedIo::new(rd.take_buffer(), rd.get_mut());
    netra_io::copy_until_eof(&mut io, w, pool).await
}

/// Forwards a chunked body: each size line, its payload, and the trailing
/// CRLFs go to `w` exactly as read, through the terminating zero chunk.
async fn forward_chunked<R, W>(rd: &mut Reader<R>, w: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut line = Vec::with_capacity(MAX_HEX_DIGITS + 2);
    loop {
        line.clear();
        let size = read_chunk_size(rd, &mut line).await?;
        w.write_all(&line).await?;

        forward_exact(rd, w, size).await?;
        expect_crlf(rd).await?;
        w.write_all(b"\r\n").await?;

        total += size;
        if size == 0 {
            return Ok(total);
        }
    }
}

/// Parses a hex chunk-size line, accumulating its raw bytes into `line`.
async fn read_chunk_size<R>(rd: &mut Reader<R>, line: &mut Vec<u8>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut size = 0u64;
    let mut digits = 0;
    loop {
        let c = rd.read_byte().await?;
        let k = HEX_TABLE[c as usize];
        if k == 16 {
            if digits == 0 {
                return Err(invalid("empty chunk size"));
            }
            if c != b'\r' {
                return Err(invalid("unexpected character after chunk size"));
            }
            line.push(c);
            let lf = rd.read_byte().await?;
            line.push(lf);
            if lf != b'\n' {
                return Err(invalid("chunk size line missing LF"));
            }
            return Ok(size);
        }
        if digits >= MAX_HEX_DIGITS {
            return Err(invalid("chunk size is too large"));
        }
        size = (size << 4) | u64::from(k);
        digits += 1;
        line.push(c);
    }
}

async fn expect_crlf<R>(rd: &mut Reader<R>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    if rd.read_byte().await? != b'\r' || rd.read_byte().await? != b'\n' {
        return Err(invalid("missing CRLF after chunk payload"));
    }
    Ok(())
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(kind: BodyKind, input: &[u8]) -> io::Result<(u64, Vec<u8>)> {
        let pool = BufferPool::new();
        let mut rd = Reader::new(input);
        let mut out = Vec::new();
        let n = stream(&mut rd, &mut out, kind, &pool).await?;
        Ok((n, out))
    }

    #[tokio::test]
    async fn fixed_forwards_exactly_n() {
        let (n, out) = run(BodyKind::Fixed(5), b"helloGET /next").await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn fixed_eof_short_is_an_error() {
        let err = run(BodyKind::Fixed(10), b"short").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn chunked_round_trips() {
        let body = b"4\r\ndata\r\n4\r\ntest\r\n0\r\n\r\n";
        let (n, out) = run(BodyKind::Chunked, body).await.unwrap();
        assert_eq!(n, 8);
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn chunked_preserves_hex_casing() {
        let mut body = b"A\r\n0123456789\r\n0\r\n\r\n".to_vec();
        let (n, out) = run(BodyKind::Chunked, &body).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(out, body);

        body = b"a\r\n0123456789\r\n0\r\n\r\n".to_vec();
        let (_, out) = run(BodyKind::Chunked, &body).await.unwrap();
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn chunked_leaves_pipelined_bytes_buffered() {
        let input = b"3\r\nabc\r\n0\r\n\r\nGET /next HTTP/1.1\r\n\r\n";
        let pool = BufferPool::new();
        let mut rd = Reader::new(&input[..]);
        let mut out = Vec::new();
        stream(&mut rd, &mut out, BodyKind::Chunked, &pool)
            .await
            .unwrap();
        assert_eq!(out, b"3\r\nabc\r\n0\r\n\r\n");
        // The next pipelined head is untouched.
        match rd.read_request_head().await.unwrap() {
            crate::reader::ReadHead::Head { head, .. } => assert_eq!(head.target, "/next"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn overlong_hex_run_is_rejected() {
        let body = b"0000000000000004\r\ndata\r\n0\r\n\r\n";
        let err = run(BodyKind::Chunked, body).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn chunk_extension_is_rejected() {
        let body = b"4;ext=1\r\ndata\r\n0\r\n\r\n";
        let err = run(BodyKind::Chunked, body).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn missing_chunk_crlf_is_rejected() {
        let body = b"4\r\ndataXX0\r\n\r\n";
        let err = run(BodyKind::Chunked, body).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn until_eof_copies_everything() {
        let (n, out) = run(BodyKind::UntilEof, b"anything goes").await.unwrap();
        assert_eq!(n, 13);
        assert_eq!(out, b"anything goes");
    }

    #[tokio::test]
    async fn empty_body_forwards_nothing() {
        let (n, out) = run(BodyKind::Empty, b"GET /next").await.unwrap();
        assert_eq!(n, 0);
        assert!(out.is_empty());
    }
}
