//! Async change streams over committed transitions.
//!
//! Callback subscriptions (the listener registry) cover synchronous UI
//! delivery; [`StateStream`] serves async consumers that want committed
//! states as a `Stream`. Slow consumers that lag behind the channel
//! capacity skip ahead rather than stall the store.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use tokio::sync::broadcast;
use tokio_stream::Stream;

/// One committed transition, as delivered to stream consumers.
#[derive(Debug, Clone)]
pub struct StateChange<S> {
    /// The state committed by this transition.
    pub state: Arc<S>,
    /// Meta tag the writer attached, if any.
    pub meta: Option<String>,
    /// When the transition was accepted.
    pub at: SystemTime,
}

/// A stream of committed transitions.
pub struct StateStream<S> {
    receiver: broadcast::Receiver<StateChange<S>>,
}

impl<S: Clone> Stream for StateStream<S> {
    type Item = StateChange<S>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.receiver.try_recv() {
                Ok(change) => return Poll::Ready(Some(change)),
                Err(broadcast::error::TryRecvError::Empty) => {
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Err(broadcast::error::TryRecvError::Closed) => return Poll::Ready(None),
                // Skip lagged events; consumers observe the newest state.
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            }
        }
    }
}

/// Handle for fanning committed transitions out to stream subscribers.
pub struct ChangeSender<S> {
    sender: broadcast::Sender<StateChange<S>>,
}

impl<S> Clone for ChangeSender<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S: Clone> ChangeSender<S> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Broadcast a committed transition. No subscribers is not an error.
    pub fn send(&self, change: StateChange<S>) {
        let _ = self.sender.send(change);
    }

    /// Open a stream of future transitions.
    pub fn subscribe(&self) -> StateStream<S> {
        StateStream {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of open streams.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<S: Clone> Default for ChangeSender<S> {
    fn default() -> Self {
        Self::new(1024)
    }
}
