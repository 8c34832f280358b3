//! Command-update ordering gate (spec.md §4.7, C7).
//!
//! Guarantees that `data`/`cmddone`/`cmdfinal` handlers for a given [`CmdKey`] never
//! observe a command before its row is committed. The orchestrator calls
//! [`CmdWaitGate::start_wait`] before sending the `run` packet; any handler that arrives
//! for that `ck` while it is still gated blocks in [`CmdWaitGate::wait_until_open`] until
//! the orchestrator's success path calls [`CmdWaitGate::finish_wait`]. A `ck` that was
//! never gated (or has already been opened) passes through immediately, matching "once
//! removed, handlers run inline" from the spec.
//!
//! Built on `tokio::sync::watch` rather than a literal closure queue: a watch receiver's
//! `borrow()` always reflects the latest value sent, even if the send happened before the
//! receiver subscribed, so there is no missed-wakeup race between a handler checking the
//! gate and the orchestrator flipping it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::watch;

use waveshell_proto::CmdKey;

#[derive(Default)]
pub struct CmdWaitGate {
    slots: StdMutex<HashMap<CmdKey, watch::Sender<bool>>>,
}

impl CmdWaitGate {
    pub fn new() -> Self {
        CmdWaitGate {
            slots: StdMutex::new(HashMap::new()),
        }
    }

    /// Called by the orchestrator before sending the `run` packet.
    pub fn start_wait(&self, ck: CmdKey) {
        let (tx, _rx) = watch::channel(false);
        self.slots.lock().unwrap().insert(ck, tx);
    }

    /// Remove the gate for `ck` without opening it (used when a run attempt fails before
    /// any data/done packet could plausibly have been emitted for it).
    pub fn abandon_wait(&self, ck: &CmdKey) {
        self.slots.lock().unwrap().remove(ck);
    }

    /// Mark `ck`'s command row committed: wakes every handler parked in
    /// [`Self::wait_until_open`] and makes future calls for this `ck` return immediately.
    pub fn finish_wait(&self, ck: &CmdKey) {
        if let Some(tx) = self.slots.lock().unwrap().remove(ck) {
            let _ = tx.send(true);
        }
    }

    /// Block until `ck`'s row is committed, or return immediately if it was never gated or
    /// has already been opened.
    pub async fn wait_until_open(&self, ck: &CmdKey) {
        let tx = self.slots.lock().unwrap().get(ck).cloned();
        let Some(tx) = tx else { return };
        let mut rx = tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn waiter_blocks_until_finish_wait() {
        let gate = Arc::new(CmdWaitGate::new());
        let ck = CmdKey::new("s1", "c1");
        gate.start_wait(ck.clone());

        let ran = Arc::new(AtomicU32::new(0));
        let gate2 = gate.clone();
        let ck2 = ck.clone();
        let ran2 = ran.clone();
        let handle = tokio::spawn(async move {
            gate2.wait_until_open(&ck2).await;
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0, "must not run before finish_wait");

        gate.finish_wait(&ck);
        handle.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_open_key_passes_through_immediately() {
        let gate = CmdWaitGate::new();
        let ck = CmdKey::new("s1", "c1");
        gate.start_wait(ck.clone());
        gate.finish_wait(&ck);

        tokio::time::timeout(Duration::from_millis(50), gate.wait_until_open(&ck))
            .await
            .expect("should return immediately once opened");
    }

    #[tokio::test]
    async fn ungated_key_passes_through_immediately() {
        let gate = CmdWaitGate::new();
        let ck = CmdKey::new("s1", "c1");
        tokio::time::timeout(Duration::from_millis(50), gate.wait_until_open(&ck))
            .await
            .expect("never-gated key should not block");
    }

    #[tokio::test]
    async fn abandon_wait_releases_any_waiters() {
        let gate = Arc::new(CmdWaitGate::new());
        let ck = CmdKey::new("s1", "c1");
        gate.start_wait(ck.clone());
        gate.abandon_wait(&ck);

        tokio::time::timeout(Duration::from_millis(50), gate.wait_until_open(&ck))
            .await
            .expect("abandoned gate has no entry left to block on");
    }
}
