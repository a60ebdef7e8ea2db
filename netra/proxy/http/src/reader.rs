use crate::head::{parse_request, parse_response, ParseError, RequestHead, ResponseHead};
use bytes::{Buf, Bytes, BytesMut};
use netra_io::{AsyncRead, AsyncReadExt};
use std::io;

/// The sniff-buffer cap: a head that does not complete within this many
/// bytes forces fallback. Roughly a few MSS-sized segments, so a
/// misclassified bulk stream cannot make the proxy buffer without bound.
pub const SNIFF_CAPACITY: usize = 4 * 1024;

/// The outcome of attempting to read one message head.
#[derive(Debug)]
pub enum ReadHead<H> {
    /// A complete head, plus its raw wire bytes for verbatim replay.
    Head { head: H, raw: Bytes },
    /// The stream ended cleanly before any bytes of a new message.
    Eof,
    /// The prefix cannot be a valid head, or outgrew the sniff cap; the
    /// sniffed bytes remain buffered for replay.
    Fallback(ParseError),
}

/// A buffered reader over one direction of a proxied connection.
///
/// Bytes are pulled into an internal buffer and only consumed once a head
/// parses, so an unparseable prefix can be replayed verbatim. Leftover
/// bytes after a head (the body, or a pipelined successor) stay buffered
/// for the body forwarder.
#[derive(Debug)]
pub struct Reader<T> {
    io: T,
    buf: BytesMut,
}

// === impl Reader ===

impl<T: AsyncRead + Unpin> Reader<T> {
    pub fn new(io: T) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(SNIFF_CAPACITY),
        }
    }

    pub async fn read_request_head(&mut self) -> io::Result<ReadHead<RequestHead>> {
        self.read_head(parse_request).await
    }

    pub async fn read_response_head(&mut self) -> io::Result<ReadHead<ResponseHead>> {
        self.read_head(parse_response).await
    }

    async fn read_head<H>(
        &mut self,
        parse: impl Fn(&[u8]) -> Result<Option<(H, usize)>, ParseError>,
    ) -> io::Result<ReadHead<H>> {
        loop {
            if !self.buf.is_empty() {
                match parse(&self.buf) {
                    Ok(Some((head, len))) => {
                        let raw = self.buf.split_to(len).freeze();
                        return Ok(ReadHead::Head { head, raw });
                    }
                    Ok(None) => {
                        if self.buf.len() >= SNIFF_CAPACITY {
                            return Ok(ReadHead::Fallback(ParseError::TooLong));
                        }
                    }
                    Err(e) => return Ok(ReadHead::Fallback(e)),
                }
            }
            if self.fill().await? == 0 {
                return Ok(if self.buf.is_empty() {
                    ReadHead::Eof
                } else {
                    ReadHead::Fallback(ParseError::Truncated)
                });
            }
        }
    }

    /// Reads more bytes from the underlying stream into the buffer,
    /// returning 0 at EOF.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.io.read_buf(&mut self.buf).await
    }

    /// The buffered, not-yet-consumed bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Takes the entire buffer, leaving the reader empty.
    pub fn take_buffer(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub async fn read_byte(&mut self) -> io::Result<u8> {
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let b = self.buf[0];
        self.buf.advance(1);
        Ok(b)
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_pipelined_heads() {
        let raw = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut rd = Reader::new(&raw[..]);

        match rd.read_request_head().await.unwrap() {
            ReadHead::Head { head, raw } => {
                assert_eq!(head.target, "/a");
                assert!(raw.ends_with(b"\r\n\r\n"));
            }
            other => panic!("unexpected {:?}", other),
        }
        match rd.read_request_head().await.unwrap() {
            ReadHead::Head { head, .. } => assert_eq!(head.target, "/b"),
            other => panic!("unexpected {:?}", other),
        }
        match rd.read_request_head().await.unwrap() {
            ReadHead::Eof => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn garbage_prefix_stays_buffered_for_replay() {
        let raw = b"GARBAGE\n\nmore bytes";
        let mut rd = Reader::new(&raw[..]);

        match rd.read_request_head().await.unwrap() {
            ReadHead::Fallback(_) => {}
            other => panic!("unexpected {:?}", other),
        }
        // Everything read so far is still available.
        assert_eq!(rd.take_buffer().as_ref(), raw);
    }

    #[tokio::test]
    async fn truncated_head_falls_back() {
        let raw = b"GET /a HTTP/1.1\r\nHost:";
        let mut rd = Reader::new(&raw[..]);
        match rd.read_request_head().await.unwrap() {
            ReadHead::Fallback(ParseError::Truncated) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rd.buffer(), raw);
    }

    #[tokio::test]
    async fn oversized_head_falls_back() {
        let mut raw = b"GET /a HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'x').take(SNIFF_CAPACITY));
        let mut rd = Reader::new(&raw[..]);
        match rd.read_request_head().await.unwrap() {
            ReadHead::Fallback(ParseError::TooLong) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
