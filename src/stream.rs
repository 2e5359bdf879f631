//! Async stream over a subscription's published results.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::Stream;

use crate::result::ResultRows;

/// A stream of result sets published by a subscription.
///
/// Yields once per published (i.e. changed) result, starting with the first
/// publish after the stream is created. The stream ends when the
/// subscription's holder is dropped (unsubscribe or shutdown releases it
/// once every handle is gone).
pub struct ResultStream {
   inner: WatchStream<Option<ResultRows>>,
}

impl ResultStream {
   pub(crate) fn new(rx: watch::Receiver<Option<ResultRows>>) -> Self {
      Self {
         inner: WatchStream::from_changes(rx),
      }
   }
}

impl Stream for ResultStream {
   type Item = ResultRows;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      loop {
         let inner = Pin::new(&mut self.inner);
         match inner.poll_next(cx) {
            // the holder starts at None; observers only care about results
            Poll::Ready(Some(None)) => continue,
            Poll::Ready(Some(Some(rows))) => return Poll::Ready(Some(rows)),
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => return Poll::Pending,
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::sync::Arc;
   use tokio_stream::StreamExt;

   #[tokio::test]
   async fn test_stream_yields_published_results() {
      let (tx, rx) = watch::channel(None);
      let mut stream = ResultStream::new(rx);

      tx.send(Some(Arc::new(Vec::new()))).unwrap();
      let first = stream.next().await.unwrap();
      assert!(first.is_empty());

      drop(tx);
      assert!(stream.next().await.is_none());
   }
}
