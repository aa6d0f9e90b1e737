//! Digest-computing read adapter.
//!
//! Restore streams are piped straight from the archive into a cache
//! volume; [`DigestReader`] sits in the middle so the SHA-256 and byte
//! count are ready the moment the copy finishes, without a second pass
//! over the stored bytes.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use pdrcache_core::{Checksum, Sha256Digest};

/// Wraps an [`AsyncRead`], hashing everything that flows through it.
pub struct DigestReader<R> {
    inner: R,
    digest: Sha256Digest,
}

impl<R> DigestReader<R> {
    /// Wraps `inner`, starting with an empty digest.
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digest: Sha256Digest::new(),
        }
    }

    /// Bytes hashed so far.
    #[must_use]
    pub fn bytes_seen(&self) -> u64 {
        self.digest.bytes_seen()
    }

    /// Consumes the adapter, yielding the checksum and total byte count.
    #[must_use]
    pub fn finish(self) -> (Checksum, u64) {
        self.digest.finish()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        let already_filled = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                me.digest.update(&buf.filled()[already_filled..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
