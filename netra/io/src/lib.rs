#![deny(warnings, rust_2018_idioms)]

mod prefixed;

pub use self::prefixed::PrefixedIo;
pub use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// The capacity of pooled copy buffers. Roughly a few MSS-sized segments.
pub const BUFFER_CAPACITY: usize = 4 * 1024;

/// A pool of scratch buffers for body/stream copies.
///
/// Checked-out buffers are returned on drop, so every exit path of a copy
/// task releases its buffer.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
}

/// A buffer checked out of a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuf<'p> {
    pool: &'p BufferPool,
    buf: Option<BytesMut>,
}

// === impl BufferPool ===

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkout(&self) -> PooledBuf<'_> {
        let buf = self
            .free
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(BUFFER_CAPACITY));
        PooledBuf {
            pool: self,
            buf: Some(buf),
        }
    }

    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        self.free.lock().expect("buffer pool poisoned").push(buf);
    }
}

// === impl PooledBuf ===

impl Deref for PooledBuf<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer already released")
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer already released")
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

/// Copies `src` to `dst` until EOF using a buffer checked out of `pool`,
/// returning the number of bytes forwarded.
pub async fn copy_until_eof<R, W>(
    src: &mut R,
    dst: &mut W,
    pool: &BufferPool,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = pool.checkout();
    let mut total = 0u64;
    loop {
        buf.clear();
        let n = src.read_buf(&mut *buf).await?;
        if n == 0 {
            dst.flush().await?;
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
