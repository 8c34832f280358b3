use tokio::sync::broadcast;

use crate::model::{Update, UserInputRequest, UserInputResponse};

const UPDATE_BUS_CAPACITY: usize = 256;

/// Fan-out channel the core publishes [`Update`]s to; any number of UI frontends subscribe.
pub struct UpdateBus {
    tx: broadcast::Sender<Update>,
}

impl UpdateBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(UPDATE_BUS_CAPACITY);
        UpdateBus { tx }
    }

    pub fn publish(&self, update: Update) {
        // No subscribers is not an error; the update is simply dropped.
        let _ = self.tx.send(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Update> {
        self.tx.subscribe()
    }
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes password/passphrase prompts (spec.md §4.8/§4.9) from a running pty out to
/// whichever UI surface is attached, and carries the typed answer back in.
pub struct UserInputBus {
    requests_tx: broadcast::Sender<UserInputRequest>,
}

impl UserInputBus {
    pub fn new() -> Self {
        let (requests_tx, _rx) = broadcast::channel(UPDATE_BUS_CAPACITY);
        UserInputBus { requests_tx }
    }

    pub fn subscribe_requests(&self) -> broadcast::Receiver<UserInputRequest> {
        self.requests_tx.subscribe()
    }

    pub fn publish_request(&self, req: UserInputRequest) {
        let _ = self.requests_tx.send(req);
    }
}

impl Default for UserInputBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A one-shot reply slot for a single outstanding [`UserInputRequest`].
pub struct UserInputSlot {
    tx: tokio::sync::oneshot::Sender<UserInputResponse>,
}

impl UserInputSlot {
    pub fn respond(self, response: UserInputResponse) {
        let _ = self.tx.send(response);
    }
}

pub fn user_input_channel() -> (UserInputSlot, tokio::sync::oneshot::Receiver<UserInputResponse>) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    (UserInputSlot { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_updates() {
        let bus = UpdateBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Update::SessionUpdateForRemote {
            session_id: "s1".into(),
            remote_id: "r1".into(),
        });
        let got = rx.recv().await.unwrap();
        match got {
            Update::SessionUpdateForRemote { session_id, remote_id } => {
                assert_eq!(session_id, "s1");
                assert_eq!(remote_id, "r1");
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = UpdateBus::new();
        bus.publish(Update::SessionUpdateForRemote {
            session_id: "s1".into(),
            remote_id: "r1".into(),
        });
    }

    #[tokio::test]
    async fn user_input_slot_round_trips_a_response() {
        let bus = UserInputBus::new();
        let mut req_rx = bus.subscribe_requests();
        bus.publish_request(UserInputRequest {
            remote_id: "r1".into(),
            query: "Password:".into(),
            is_passphrase: false,
        });
        let req = req_rx.recv().await.unwrap();
        assert_eq!(req.remote_id, "r1");

        let (slot, rx) = user_input_channel();
        slot.respond(UserInputResponse {
            text: Some("hunter2".into()),
            timed_out: false,
        });
        let resp = rx.await.unwrap();
        assert_eq!(resp.text.as_deref(), Some("hunter2"));
    }
}
