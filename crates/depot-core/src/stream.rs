//! Streaming body wrappers used by the upload controller.
//!
//! Neither wrapper is tied to any particular HTTP stack -- both operate over any
//! `Stream<Item = io::Result<Bytes>>`, which is what a caller hands the registry whether the
//! bytes originate from an HTTP request body, a local file, or a mounted blob being copied.
use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures_core::stream::Stream;
use pin_project::pin_project;

use crate::Digester;

/// A boxed stream of byte chunks, read to EOF by the upload controller.
pub type InputBody = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

type StreamableBody = Box<(dyn Stream<Item = io::Result<Bytes>> + Send)>;

/// Wraps an [`InputBody`] and calculates the digest of the contents as they are read,
/// without buffering them -- bytes are forwarded to the next consumer (ultimately the
/// upload's temp file) as soon as they are hashed.
#[pin_project]
pub struct DigestBody {
    body: InputBody,
    digester: Arc<Mutex<Digester>>,
}

impl DigestBody {
    pub fn from_body(body: InputBody, digester: Arc<Mutex<Digester>>) -> StreamableBody {
        Box::new(Self { body, digester })
    }
}

impl Stream for DigestBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        match Pin::new(&mut this.body).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                {
                    let mut g = this.digester.lock().expect(
                        "only one instance of the digester should ever be active at a time",
                    );
                    g.update(bytes.as_ref());
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

const CHUNK_SIZE: usize = 6 * 1024 * 1024; // 6 MB

/// Turns an [`InputBody`] into a stream of fixed-size [`bytes::Bytes`] chunks, buffering
/// short reads so each yielded chunk (except the last) is exactly [`CHUNK_SIZE`] -- the size
/// object store drivers that require fixed-size multipart parts (eg S3) expect.
#[pin_project]
pub struct ChunkedBody {
    body: InputBody,
    buffer: BytesMut,
}

impl ChunkedBody {
    pub fn from_body(body: InputBody) -> ChunkedBody {
        ChunkedBody {
            body,
            buffer: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }
}

impl Stream for ChunkedBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match Pin::new(this.body).poll_next(cx) {
            Poll::Ready(Some(Ok(mut bytes))) => {
                let remaining = CHUNK_SIZE - this.buffer.len();
                if bytes.len() < remaining {
                    this.buffer.extend_from_slice(&bytes);
                    Poll::Pending
                } else if bytes.len() == remaining {
                    this.buffer.extend_from_slice(&bytes);
                    let buf = this.buffer.split();
                    Poll::Ready(Some(Ok(buf.freeze())))
                } else {
                    let exact = bytes.split_to(remaining);
                    this.buffer.extend_from_slice(&exact);
                    let buf = this.buffer.split();
                    this.buffer.extend_from_slice(&bytes);
                    Poll::Ready(Some(Ok(buf.freeze())))
                }
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                if !this.buffer.is_empty() {
                    let buf = this.buffer.split();
                    Poll::Ready(Some(Ok(buf.freeze())))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures_core::stream::Stream as _;
    use futures_util::stream::{self, StreamExt};

    fn body_of(chunks: Vec<&'static str>) -> InputBody {
        Box::pin(stream::iter(chunks.into_iter().map(|s| Ok(Bytes::from(s)))))
    }

    #[tokio::test]
    async fn chunked_body_splits_on_chunk_size() {
        let body = body_of(vec!["a", "b", "c"]);
        let mut chunked = ChunkedBody::from_body(body);
        let mut out = Vec::new();
        while let Some(chunk) = chunked.next().await {
            out.push(chunk.unwrap());
        }
        assert_eq!(out.concat(), Bytes::from("abc"));
    }

    #[tokio::test]
    async fn digest_body_hashes_while_forwarding() {
        let digester = Arc::new(Mutex::new(crate::oci_digest::Digester::default()));
        let body = body_of(vec!["hello", " ", "world"]);
        let mut digest_body: Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>> =
            Pin::from(DigestBody::from_body(body, digester.clone()));
        let mut out = Vec::new();
        while let Some(chunk) = digest_body.next().await {
            out.push(chunk.unwrap());
        }
        assert_eq!(out.concat(), Bytes::from("hello world"));
        assert_eq!(digester.lock().unwrap().bytes(), 11);
    }
}
