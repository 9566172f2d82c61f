use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::ChangeEvent;
use crate::StoreResult;

/// Ordered, non-replayable stream of changes for one watched key.
///
/// Yields `Ok(ChangeEvent)` in commit order. The stream finishes with `None`
/// after the subscription's cancellation token fires. If the store connection
/// is lost (or the store is closed) a single `Err` is yielded before the end,
/// so a dead subscription never just goes quiet.
///
/// Dropping the stream tears down the store-side subscription.
#[derive(Debug)]
pub struct WatchStream {
    inner: ReceiverStream<StoreResult<ChangeEvent>>,
}

impl WatchStream {
    /// Wraps the receiving half of a subscription's forwarding channel
    pub fn new(receiver: mpsc::Receiver<StoreResult<ChangeEvent>>) -> Self {
        Self {
            inner: ReceiverStream::new(receiver),
        }
    }

    /// Creates a connected sender/stream pair with the given buffer size
    pub fn channel(buffer: usize) -> (mpsc::Sender<StoreResult<ChangeEvent>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }
}

impl Stream for WatchStream {
    type Item = StoreResult<ChangeEvent>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Hands one item to the subscriber, giving up if the subscription is cancelled
/// or the subscriber went away while waiting for buffer space.
///
/// Returns `false` when forwarding should stop.
pub(crate) async fn deliver(
    tx: &mpsc::Sender<StoreResult<ChangeEvent>>,
    item: StoreResult<ChangeEvent>,
    cancel: &tokio_util::sync::CancellationToken,
) -> bool {
    tokio::select! {
        sent = tx.send(item) => sent.is_ok(),
        _ = cancel.cancelled() => false,
    }
}
