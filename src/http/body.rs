//! Response bodies as a sequence of byte chunks.
//!
//! A [`Body`] is consumed one chunk at a time with [`Body::next_chunk`], so a
//! cached file can be streamed to the socket without being read into memory.
//! The total length is always known up front, which keeps `Content-Length`
//! framing possible for every variant.

use std::collections::VecDeque;
use std::io;

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Upper bound on a single chunk read from a file-backed body (8 KiB).
pub const FILE_CHUNK_SIZE: usize = 8 * 1024;

/// A response body.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use rttp_diskcache::http::Body;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> std::io::Result<()> {
/// let body = Body::from_chunks([Bytes::from("hello, "), Bytes::from("world")]);
/// assert_eq!(body.len(), 12);
/// assert_eq!(body.collect().await?, Bytes::from("hello, world"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Body {
    kind: Kind,
}

#[derive(Debug, Default)]
enum Kind {
    #[default]
    Empty,
    Full(Bytes),
    Chunks {
        chunks: VecDeque<Bytes>,
        len: u64,
    },
    // Lazily read; `remaining` caps the read at the length observed on open.
    File {
        file: File,
        remaining: u64,
    },
}

impl Body {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a body that yields `chunks` in order without concatenating them.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        let chunks: VecDeque<Bytes> = chunks.into_iter().collect();
        let len = chunks.iter().map(|c| c.len() as u64).sum();
        Self {
            kind: Kind::Chunks { chunks, len },
        }
    }

    /// Builds a body that streams `len` bytes from an already opened file.
    pub fn from_file(file: File, len: u64) -> Self {
        Self {
            kind: Kind::File {
                file,
                remaining: len,
            },
        }
    }

    /// Number of bytes this body still has to yield.
    pub fn len(&self) -> u64 {
        match &self.kind {
            Kind::Empty => 0,
            Kind::Full(bytes) => bytes.len() as u64,
            Kind::Chunks { len, .. } => *len,
            Kind::File { remaining, .. } => *remaining,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the next chunk, or `None` once the body is exhausted.
    ///
    /// # Errors
    ///
    /// File-backed bodies fail with [`io::ErrorKind::UnexpectedEof`] if the
    /// file turns out shorter than the length recorded when it was opened.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if let Kind::Full(_) = self.kind {
            if let Kind::Full(bytes) = std::mem::take(&mut self.kind) {
                return Ok(Some(bytes));
            }
        }

        match &mut self.kind {
            Kind::Empty | Kind::Full(_) => Ok(None),
            Kind::Chunks { chunks, len } => {
                let chunk = chunks.pop_front();
                if let Some(chunk) = &chunk {
                    *len -= chunk.len() as u64;
                }
                Ok(chunk)
            }
            Kind::File { file, remaining } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let want = (*remaining).min(FILE_CHUNK_SIZE as u64) as usize;
                let mut buf = BytesMut::with_capacity(want);
                let read = file.read_buf(&mut buf).await?;
                if read == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "cached file is shorter than its recorded length",
                    ));
                }
                buf.truncate(want.min(read));
                *remaining -= buf.len() as u64;
                Ok(Some(buf.freeze()))
            }
        }
    }

    /// Drains the body into its chunks, keeping chunk boundaries.
    pub async fn collect_chunks(mut self) -> io::Result<Vec<Bytes>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.push(chunk);
        }
        Ok(out)
    }

    /// Drains the body into one contiguous buffer.
    pub async fn collect(self) -> io::Result<Bytes> {
        let capacity = self.len() as usize;
        let mut buf = BytesMut::with_capacity(capacity);
        for chunk in self.collect_chunks().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            Self::empty()
        } else {
            Self {
                kind: Kind::Full(bytes),
            }
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Bytes::from(s).into()
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Bytes::from_static(s.as_bytes()).into()
    }
}
