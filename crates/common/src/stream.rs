use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    task::{
        Context,
        Poll,
    },
};

use bytes::Bytes;
use errors::ErrorMetadata;
use futures::{
    stream::BoxStream,
    Stream,
};

/// An inbound request body: ordered buffers pulled from the client.
pub type FileStream = BoxStream<'static, io::Result<Bytes>>;

/// Error injected into a [`CountingStream`] when the client transmits more
/// than the declared maximum.
#[derive(Debug, thiserror::Error)]
#[error("stream exceeded the declared maximum of {max_bytes} bytes")]
pub struct StreamLimitExceeded {
    pub max_bytes: u64,
}

pub fn is_stream_limit_exceeded(err: &io::Error) -> bool {
    err.get_ref()
        .map(|inner| inner.is::<StreamLimitExceeded>())
        .unwrap_or(false)
}

/// The ErrorMetadata tag providers attach when a truncated save traces back
/// to the byte ceiling rather than an I/O fault.
pub fn oversize_stream_error(max_bytes: u64) -> ErrorMetadata {
    ErrorMetadata::payload_too_large(
        "OversizeStream",
        format!("request body exceeded the declared maximum of {max_bytes} bytes"),
    )
}

/// Wraps a failure while draining an inbound body, tagging the byte-ceiling
/// case so callers can tell a lying client from a broken connection.
pub fn map_body_error(e: io::Error, max_bytes: u64) -> anyhow::Error {
    if is_stream_limit_exceeded(&e) {
        anyhow::anyhow!(e).context(oversize_stream_error(max_bytes))
    } else {
        anyhow::anyhow!(e).context("failed reading request body")
    }
}

/// Shared view of how many bytes a [`CountingStream`] has passed through.
/// Remains readable after the stream has been consumed by a provider; the
/// final value is the single source of truth for how much was actually
/// written.
#[derive(Clone)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wraps an inbound stream with a running byte counter and a hard ceiling.
///
/// Each buffer is checked *before* it is forwarded: if accepting it would
/// push the total past `max_bytes`, the stream fails with
/// [`StreamLimitExceeded`] and yields nothing further. Downstream writers
/// observe a truncated stream and must treat it as a write error.
pub struct CountingStream {
    inner: FileStream,
    max_bytes: u64,
    received: Arc<AtomicU64>,
    failed: bool,
}

impl CountingStream {
    pub fn new(inner: FileStream, max_bytes: u64) -> (Self, ByteCounter) {
        let received = Arc::new(AtomicU64::new(0));
        let counter = ByteCounter(received.clone());
        let stream = Self {
            inner,
            max_bytes,
            received,
            failed: false,
        };
        (stream, counter)
    }
}

impl Stream for CountingStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.failed {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(buf))) => {
                let received = this.received.load(Ordering::SeqCst);
                if received + buf.len() as u64 > this.max_bytes {
                    this.failed = true;
                    let err = io::Error::other(StreamLimitExceeded {
                        max_bytes: this.max_bytes,
                    });
                    return Poll::Ready(Some(Err(err)));
                }
                this.received.fetch_add(buf.len() as u64, Ordering::SeqCst);
                Poll::Ready(Some(Ok(buf)))
            },
            other => other,
        }
    }
}
