//! Cancellation-aware queue plumbing for the engine loops.
//!
//! The multi-threaded mode moves outbound PDUs and dispatch work
//! between loops through standard `mpsc` channels.
//! Blocking forever on `recv` would make shutdown hang,
//! so dequeues poll with a short timeout and watch a shared
//! cancellation token in between.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// How long a dequeue waits before rechecking the cancellation token.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A shared flag asking all loops of an association to wind down.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Dequeue the next item,
/// returning `None` once the token is cancelled
/// or all senders are gone.
pub(crate) fn recv_cancellable<T>(receiver: &Receiver<T>, token: &CancelToken) -> Option<T> {
    loop {
        if token.is_cancelled() {
            return None;
        }
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(item) => return Some(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn items_come_out_in_order() {
        let (tx, rx) = channel();
        let token = CancelToken::new();
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(recv_cancellable(&rx, &token), Some(1));
        assert_eq!(recv_cancellable(&rx, &token), Some(2));
    }

    #[test]
    fn cancellation_unblocks_a_pending_dequeue() {
        let (_tx, rx) = channel::<u8>();
        let token = CancelToken::new();
        let observer = token.clone();

        let handle = std::thread::spawn(move || recv_cancellable(&rx, &observer));
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn dropping_all_senders_unblocks_a_pending_dequeue() {
        let (tx, rx) = channel::<u8>();
        let token = CancelToken::new();

        let handle = std::thread::spawn(move || recv_cancellable(&rx, &token));
        std::thread::sleep(Duration::from_millis(20));
        drop(tx);
        assert_eq!(handle.join().unwrap(), None);
    }
}
