//! Per-command packet routing: the core can address `DataAck`, `SpecialInput`, and
//! `SudoResponse` packets at a specific in-flight command by its [`CmdKey`]. This mirrors
//! `waveshell_transport`'s `req_id` mailbox demux on the core side, but keyed by `CmdKey`
//! instead, since run commands don't carry a single `req_id` for their whole lifetime.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use waveshell_proto::{CmdKey, Packet};

const DISPATCH_CHANNEL_SIZE: usize = 32;

/// Live routing table from a running command's key to its inbox.
#[derive(Default)]
pub struct Dispatch {
    inner: Mutex<HashMap<CmdKey, mpsc::Sender<Packet>>>,
}

impl Dispatch {
    pub fn new() -> Self {
        Dispatch::default()
    }

    /// Register a fresh inbox for `ck`, returning its receiving half.
    pub fn register(&self, ck: CmdKey) -> mpsc::Receiver<Packet> {
        let (tx, rx) = mpsc::channel(DISPATCH_CHANNEL_SIZE);
        self.inner.lock().unwrap().insert(ck, tx);
        rx
    }

    /// Drop `ck`'s inbox; further routed packets for it are silently dropped.
    pub fn unregister(&self, ck: &CmdKey) {
        self.inner.lock().unwrap().remove(ck);
    }

    /// Route `packet` to `ck`'s inbox. Returns `false` if no command is registered for it
    /// (the command already finished, or the core addressed a stale key).
    pub async fn route(&self, ck: &CmdKey, packet: Packet) -> bool {
        let tx = self.inner.lock().unwrap().get(ck).cloned();
        match tx {
            Some(tx) => tx.send(packet).await.is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_to_the_registered_inbox() {
        let dispatch = Dispatch::new();
        let ck = CmdKey::new("screen1", "line1");
        let mut rx = dispatch.register(ck.clone());

        let delivered = dispatch
            .route(
                &ck,
                Packet::DataAck {
                    ck: ck.clone(),
                    ack_len: 10,
                    error: None,
                },
            )
            .await;
        assert!(delivered);
        assert!(matches!(rx.recv().await, Some(Packet::DataAck { .. })));
    }

    #[tokio::test]
    async fn routing_to_an_unregistered_key_reports_undelivered() {
        let dispatch = Dispatch::new();
        let ck = CmdKey::new("screen1", "line1");
        let delivered = dispatch.route(&ck, Packet::Ping).await;
        assert!(!delivered);
    }

    #[tokio::test]
    async fn unregister_stops_further_delivery() {
        let dispatch = Dispatch::new();
        let ck = CmdKey::new("screen1", "line1");
        let _rx = dispatch.register(ck.clone());
        dispatch.unregister(&ck);
        assert!(!dispatch.route(&ck, Packet::Ping).await);
    }
}
