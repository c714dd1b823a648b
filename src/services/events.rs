// src/services/events.rs
//! Fire-and-forget notifications about issuance, revocation and publication.

use crate::models::did::Did;
use crate::utils::crypto::Hash;
use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    CredentialCreated { issuer: Did, credential_id: Uuid },
    CredentialRevoked { issuer: Did, nonce: u64 },
    StateConfirmed { issuer: Did, state: Hash, block: u64 },
}

pub trait EventBus: Send + Sync {
    /// Never blocks and never fails the caller.
    fn publish(&self, event: Event);
}

/// In-process bus over a tokio broadcast channel. Events published while
/// nobody listens are dropped.
pub struct BroadcastBus {
    sender: broadcast::Sender<Event>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, event: Event) {
        debug!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = BroadcastBus::new(8);
        let mut rx = bus.subscribe();
        let issuer = Did::parse("did:x:issuer").unwrap();
        bus.publish(Event::CredentialRevoked { issuer: issuer.clone(), nonce: 9 });
        assert_eq!(rx.recv().await.unwrap(), Event::CredentialRevoked { issuer, nonce: 9 });
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = BroadcastBus::default();
        bus.publish(Event::StateConfirmed { issuer: Did::parse("did:x:a").unwrap(), state: Hash::ZERO, block: 1 });
    }
}
