use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use tracing::warn;

/// Sending half of a bounded hand-off queue that never blocks.
///
/// When the consumer falls behind the newest item is dropped and counted so a
/// slow aggregator cannot stall the thread draining a kernel buffer.
pub struct DropSender<T> {
    tx: SyncSender<T>,
    name: Arc<str>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for DropSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            name: self.name.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

/// Create a bounded queue of `capacity` items.
pub fn bounded<T>(name: &str, capacity: usize) -> (DropSender<T>, Receiver<T>) {
    let (tx, rx) = sync_channel(capacity);
    (
        DropSender {
            tx,
            name: Arc::from(name),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

impl<T> DropSender<T> {
    /// Queue `item`. Returns false once the receiver is gone.
    pub fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(queue = %self.name, dropped, "queue full, dropping event");
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
