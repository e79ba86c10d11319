//! The contract between the driver and the socket layer.
//!
//! The driver never touches sockets. Each peer owns a [`Connection`] whose
//! queue the driver writes into; the embedding broker drains the queue into
//! the peer's socket. The queue is quota-aware: a full queue refuses the
//! message, which the driver treats as a terminal condition for the
//! receiver.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use thiserror::Error;
use tokio::sync::mpsc;
use zbus::Message;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    /// The receiver's queue is full. The driver disconnects the receiver
    /// (replies and broadcasts) or reports `LimitsExceeded` to the sender
    /// (method calls).
    #[error("receive queue quota exhausted")]
    Quota,
    /// The queue is gone. Fatal to the dispatch.
    #[error("receive queue closed")]
    Closed,
}

/// Outgoing message queue of a single peer.
pub trait MessageQueue: fmt::Debug + Send {
    fn enqueue(&self, msg: Arc<Message>) -> Result<(), EnqueueError>;

    /// Schedule the connection for shutdown. Enqueuing may keep succeeding
    /// until the embedding broker tears the peer down.
    fn shutdown(&self);
}

/// A peer's connection handle, as far as the driver is concerned.
#[derive(Debug)]
pub struct Connection {
    queue: Box<dyn MessageQueue>,
}

impl Connection {
    pub fn new(queue: Box<dyn MessageQueue>) -> Self {
        Self { queue }
    }

    pub fn enqueue(&self, msg: Arc<Message>) -> Result<(), EnqueueError> {
        self.queue.enqueue(msg)
    }

    pub fn shutdown(&self) {
        self.queue.shutdown()
    }
}

/// Production queue backed by a bounded tokio channel.
///
/// `try_send` gives exactly the semantics the driver needs: a full channel
/// maps to [`EnqueueError::Quota`], a closed one to [`EnqueueError::Closed`].
#[derive(Debug)]
pub struct ChannelQueue {
    tx: mpsc::Sender<Arc<Message>>,
    closing: Arc<AtomicBool>,
}

impl ChannelQueue {
    /// Create a queue with room for `capacity` undelivered messages. The
    /// returned receiver side is for the broker's writer task; the flag
    /// flips once the driver decided the peer has to go.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Arc<Message>>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel(capacity);
        let closing = Arc::new(AtomicBool::new(false));
        (
            Self {
                tx,
                closing: closing.clone(),
            },
            rx,
            closing,
        )
    }
}

impl MessageQueue for ChannelQueue {
    fn enqueue(&self, msg: Arc<Message>) -> Result<(), EnqueueError> {
        // A peer scheduled for shutdown silently swallows further traffic
        // until the broker gets around to removing it.
        if self.closing.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Quota,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    fn shutdown(&self) {
        self.closing.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbus::MessageBuilder;

    fn dummy_msg() -> Arc<Message> {
        Arc::new(
            MessageBuilder::signal("/org/freedesktop/DBus", "org.freedesktop.DBus", "NameLost")
                .unwrap()
                .build(&("org.example.Name",))
                .unwrap(),
        )
    }

    #[test]
    fn full_channel_reports_quota() {
        let (queue, mut rx, _) = ChannelQueue::new(1);
        queue.enqueue(dummy_msg()).unwrap();
        assert_eq!(queue.enqueue(dummy_msg()), Err(EnqueueError::Quota));
        rx.try_recv().unwrap();
        queue.enqueue(dummy_msg()).unwrap();
    }

    #[test]
    fn shutdown_swallows_further_traffic() {
        let (queue, mut rx, closing) = ChannelQueue::new(4);
        queue.shutdown();
        assert!(closing.load(Ordering::Relaxed));
        assert_eq!(queue.enqueue(dummy_msg()), Ok(()));
        assert!(rx.try_recv().is_err());
    }
}
