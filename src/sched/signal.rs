//! One-shot batch handshake signals.
//!
//! Each batch carries three latches: `inputs_ready`, `compute_started`,
//! `outputs_ready`. A latch is set exactly once and observed by any number
//! of waiters; the next batch inherits the previous batch's
//! `outputs_ready` waiter as its own `inputs_ready`.

use tokio::sync::watch;

/// The setter half of a latch.
#[derive(Debug, Clone)]
pub struct Signal {
    tx: watch::Sender<bool>,
}

/// The waiter half. Cloneable; all clones observe the same latch.
#[derive(Debug, Clone)]
pub struct SignalWaiter {
    rx: watch::Receiver<bool>,
}

/// A fresh unset latch.
pub fn signal() -> (Signal, SignalWaiter) {
    let (tx, rx) = watch::channel(false);
    (Signal { tx }, SignalWaiter { rx })
}

/// A latch that is already set, for the first batch in the pipeline.
pub fn signalled() -> SignalWaiter {
    let (tx, rx) = watch::channel(true);
    // Keep the sender alive inside the waiter's channel state.
    drop(tx);
    SignalWaiter { rx }
}

impl Signal {
    pub fn set(&self) {
        let _ = self.tx.send(true);
    }
}

impl SignalWaiter {
    /// Block until the latch is set. A dropped setter counts as set so the
    /// pipeline drains rather than hangs on failure.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_releases_waiters() {
        let (sig, waiter) = signal();
        let mut w1 = waiter.clone();
        let mut w2 = waiter;
        assert!(!w1.is_set());

        let task = tokio::spawn(async move {
            w1.wait().await;
        });
        sig.set();
        task.await.unwrap();
        w2.wait().await;
        assert!(w2.is_set());
    }

    #[tokio::test]
    async fn test_pre_set() {
        let mut w = signalled();
        w.wait().await;
        assert!(w.is_set());
    }

    #[tokio::test]
    async fn test_dropped_setter_releases() {
        let (sig, mut w) = signal();
        drop(sig);
        w.wait().await;
    }
}
