//! Chunk Stream Module
//!
//! Stream adapter that regroups arbitrary upstream frames into chunks of a
//! fixed size, so every consumer downstream sees the preferred chunk size.

use crate::Result;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Re-chunks an inner byte stream to `chunk_size` pieces.
///
/// The final chunk may be shorter. Errors from the inner stream are passed
/// through after any buffered bytes have been emitted.
pub struct Rechunk<S> {
    inner: S,
    buffer: BytesMut,
    chunk_size: usize,
    pending_error: Option<crate::RelayError>,
    inner_done: bool,
}

impl<S> Rechunk<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    pub fn new(inner: S, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            inner,
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
            pending_error: None,
            inner_done: false,
        }
    }
}

impl<S> Stream for Rechunk<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.buffer.len() >= self.chunk_size {
                let chunk_size = self.chunk_size;
                let chunk = self.buffer.split_to(chunk_size).freeze();
                return Poll::Ready(Some(Ok(chunk)));
            }

            if self.inner_done {
                if !self.buffer.is_empty() {
                    let rest = self.buffer.split().freeze();
                    return Poll::Ready(Some(Ok(rest)));
                }
                return Poll::Ready(self.pending_error.take().map(Err));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(data))) => {
                    if !data.is_empty() {
                        self.buffer.extend_from_slice(&data);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.pending_error = Some(e);
                    self.inner_done = true;
                }
                Poll::Ready(None) => {
                    self.inner_done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
