//! Cooperative pause/resume gate.
//!
//! One gate is shared by every unit of a transfer: suspending delays all
//! workers at their next buffer read, resuming releases them together. The
//! gate never aborts in-flight work.

use tokio::sync::watch;

/// A broadcast open/closed signal. Workers call [`PauseGate::wait_open`]
/// before each buffer read; `suspend` closes the gate, `resume` reopens it.
#[derive(Debug)]
pub struct PauseGate {
    tx: watch::Sender<bool>,
}

impl PauseGate {
    /// Creates an open gate.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx }
    }

    /// Closes the gate. Reads that already started are not interrupted.
    pub fn suspend(&self) {
        // send_replace stores the value even with no live subscribers.
        self.tx.send_replace(false);
    }

    /// Reopens the gate, releasing every blocked worker.
    pub fn resume(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Blocks until the gate is open. Returns immediately when already open.
    pub async fn wait_open(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}
