pub mod connection;
pub mod keys;
pub mod queue;
pub mod router;
pub mod sequencer;
pub mod sessions;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use sealine_db::Database;
use sealine_db::models::ChatRow;
use sealine_types::error::RelayError;
use sealine_types::events::PushEvent;
use sealine_types::models::{Envelope, ReceiptStatus};

use crate::keys::KeyDirectory;
use crate::queue::PendingQueue;
use crate::router::DeliveryRouter;
use crate::sequencer::OrderingSequencer;
use crate::sessions::SessionStore;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How long a live push waits for the client ack before falling back to
    /// queued state.
    pub ack_timeout: Duration,
    /// Unconsumed-prekey count below which the owner is asked to replenish.
    pub prekey_low_water: u32,
    /// Live-push attempts (with backoff) while the recipient stays
    /// connected; the drain on reconnect takes over afterwards.
    pub push_retry_max: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            prekey_low_water: 10,
            push_retry_max: 3,
        }
    }
}

/// The relay core: wires the key directory, session store, pending queue,
/// sequencer and delivery router into the ingest/ack data flow, and is the
/// shared service handed to both the HTTP layer and the WebSocket
/// connections.
#[derive(Clone)]
pub struct Relay {
    pub keys: KeyDirectory,
    pub sessions: SessionStore,
    pub queue: PendingQueue,
    pub sequencer: OrderingSequencer,
    pub router: DeliveryRouter,
    db: Arc<Database>,
    push_retry_max: u32,
}

impl Relay {
    pub fn new(db: Arc<Database>, config: RelayConfig) -> Self {
        let sessions = SessionStore::new();
        let router = DeliveryRouter::new(config.ack_timeout);
        let keys = KeyDirectory::new(
            db.clone(),
            sessions.clone(),
            router.clone(),
            config.prekey_low_water,
        );
        Self {
            keys,
            sessions,
            queue: PendingQueue::new(db.clone()),
            sequencer: OrderingSequencer::new(db.clone()),
            router,
            db,
            push_retry_max: config.push_retry_max,
        }
    }

    /// Ingest one ciphertext message: resolve the chat, validate the pair's
    /// session, stamp the envelope, enqueue durably, then push live if the
    /// recipient is connected. The send is acknowledged to the sender only
    /// once the enqueue has committed.
    pub async fn ingest(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        chat_id: Option<Uuid>,
        ciphertext: Vec<u8>,
    ) -> Result<Envelope, RelayError> {
        let chat = self.resolve_chat(sender_id, recipient_id, chat_id).await?;
        let chat_uuid = parse_uuid(&chat.id)?;

        self.sessions.ensure(sender_id, recipient_id).await?;

        // Stamp, record, enqueue and hand off to the live-push worker as one
        // critical section under the chat's sequencer guard. A stamp recorded
        // outside the guard could land after a higher stamp and falsely flag
        // the pair out of sync; a hand-off outside it could let a connected
        // client observe envelope N+1 before N.
        let lock = self.sequencer.chat_lock(chat_uuid).await;
        let _guard = lock.lock().await;

        let seq = self.sequencer.advance(chat_uuid).await?;
        self.sessions
            .record_send(sender_id, recipient_id, seq)
            .await?;

        let envelope = Envelope {
            id: seq,
            chat_id: chat_uuid,
            sender_id,
            recipient_id,
            ciphertext,
            created_at: Utc::now(),
        };
        self.queue.enqueue(&envelope).await?;
        debug!(
            "Envelope {}/{} queued for {}",
            envelope.chat_id, envelope.id, recipient_id
        );

        // The hand-off is non-blocking: the sender's request is complete
        // once the envelope is durable, and the queue covers every push
        // failure.
        self.router
            .enqueue_push(envelope.clone(), self.push_retry_max)
            .await;

        Ok(envelope)
    }

    /// Recipient confirmed receipt: validate the id was ever issued, purge
    /// the envelope, advance the delivery receipt and tell the sender.
    pub async fn handle_ack(
        &self,
        recipient_id: Uuid,
        chat_id: Uuid,
        envelope_id: u64,
    ) -> Result<(), RelayError> {
        let Some(chat) = self.get_chat(chat_id).await? else {
            warn!("Ack from {} for unknown chat {}", recipient_id, chat_id);
            return Ok(());
        };
        let sender_id = other_participant(&chat, recipient_id)?;

        // An ack for an id the sequencer never issued means the pair's view
        // of the stream is corrupt: flag it and force a re-handshake.
        if envelope_id > chat.last_seq as u64 {
            warn!(
                "Ack from {} references unissued envelope {}/{}; flagging session",
                recipient_id, chat_id, envelope_id
            );
            self.sessions.flag_desync(sender_id, recipient_id).await;
            return Ok(());
        }

        self.sessions
            .advance_acked(sender_id, recipient_id, envelope_id)
            .await;
        self.router
            .resolve_ack(recipient_id, chat_id, envelope_id)
            .await;

        let removed = self.queue.ack(chat_id, envelope_id, recipient_id).await?;
        if removed {
            // A READ may already be recorded (read receipt before the ack);
            // the sender is only told about transitions that actually moved
            // the status forward.
            let advanced = self
                .advance_receipt(chat_id, envelope_id, recipient_id, ReceiptStatus::Delivered)
                .await?;
            if advanced {
                self.router
                    .send_event(
                        sender_id,
                        PushEvent::Receipt {
                            chat_id,
                            envelope_id,
                            recipient_id,
                            status: ReceiptStatus::Delivered,
                        },
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Recipient marked an envelope read. Forward-only; regressions and
    /// unknown receipts are quietly ignored.
    pub async fn handle_read(
        &self,
        recipient_id: Uuid,
        chat_id: Uuid,
        envelope_id: u64,
    ) -> Result<(), RelayError> {
        let Some(chat) = self.get_chat(chat_id).await? else {
            return Ok(());
        };
        let sender_id = other_participant(&chat, recipient_id)?;

        let advanced = self
            .advance_receipt(chat_id, envelope_id, recipient_id, ReceiptStatus::Read)
            .await?;
        if advanced {
            self.router
                .send_event(
                    sender_id,
                    PushEvent::Receipt {
                        chat_id,
                        envelope_id,
                        recipient_id,
                        status: ReceiptStatus::Read,
                    },
                )
                .await;
        }
        Ok(())
    }

    async fn resolve_chat(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        chat_id: Option<Uuid>,
    ) -> Result<ChatRow, RelayError> {
        match chat_id {
            Some(id) => {
                let chat = self
                    .get_chat(id)
                    .await?
                    .ok_or(RelayError::ChatNotFound(id))?;
                let sid = sender_id.to_string();
                let rid = recipient_id.to_string();
                let is_member =
                    |u: &str| -> bool { chat.user_a == u || chat.user_b == u };
                if !is_member(&sid) || !is_member(&rid) {
                    return Err(RelayError::NotChatMember(id));
                }
                Ok(chat)
            }
            None => {
                let db = self.db.clone();
                let sid = sender_id.to_string();
                let rid = recipient_id.to_string();
                let new_id = Uuid::new_v4().to_string();
                tokio::task::spawn_blocking(move || {
                    if db.get_user_by_id(&rid)?.is_none() {
                        return Ok(None);
                    }
                    db.find_or_create_chat(&new_id, &sid, &rid).map(Some)
                })
                .await
                .map_err(|e| RelayError::Internal(e.to_string()))?
                .map_err(|e: anyhow::Error| RelayError::StorageWrite(e.to_string()))?
                .ok_or(RelayError::UnknownUser(recipient_id))
            }
        }
    }

    async fn get_chat(&self, chat_id: Uuid) -> Result<Option<ChatRow>, RelayError> {
        let db = self.db.clone();
        let id = chat_id.to_string();
        tokio::task::spawn_blocking(move || db.get_chat(&id))
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .map_err(|e| RelayError::Internal(e.to_string()))
    }

    async fn advance_receipt(
        &self,
        chat_id: Uuid,
        envelope_id: u64,
        recipient_id: Uuid,
        status: ReceiptStatus,
    ) -> Result<bool, RelayError> {
        let db = self.db.clone();
        let cid = chat_id.to_string();
        let rid = recipient_id.to_string();
        let now = Utc::now().to_rfc3339();
        tokio::task::spawn_blocking(move || {
            db.advance_receipt(&cid, envelope_id as i64, &rid, status.as_i64(), &now)
        })
        .await
        .map_err(|e| RelayError::Internal(e.to_string()))?
        .map_err(|e| RelayError::Internal(e.to_string()))
    }
}

fn other_participant(chat: &ChatRow, user_id: Uuid) -> Result<Uuid, RelayError> {
    let uid = user_id.to_string();
    let other = if chat.user_a == uid {
        &chat.user_b
    } else if chat.user_b == uid {
        &chat.user_a
    } else {
        return Err(RelayError::NotChatMember(parse_uuid(&chat.id)?));
    };
    parse_uuid(other)
}

fn parse_uuid(s: &str) -> Result<Uuid, RelayError> {
    s.parse::<Uuid>()
        .map_err(|e| RelayError::Internal(format!("corrupt uuid '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealine_types::models::PreKey;

    struct Fixture {
        relay: Relay,
        alice: Uuid,
        bob: Uuid,
    }

    /// Two registered users with Alice's session toward Bob already
    /// bootstrapped through a real bundle fetch.
    async fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        db.create_user_if_absent(&alice.to_string(), "+15550001")
            .unwrap();
        db.create_user_if_absent(&bob.to_string(), "+15550002")
            .unwrap();

        let relay = Relay::new(
            db,
            RelayConfig {
                ack_timeout: Duration::from_millis(40),
                prekey_low_water: 2,
                push_retry_max: 1,
            },
        );

        relay
            .keys
            .register_identity(bob, "ik-bob".into(), 7)
            .await
            .unwrap();
        relay
            .keys
            .upload_prekeys(
                bob,
                (1..=4)
                    .map(|id| PreKey {
                        key_id: id,
                        public_key: format!("pk-{}", id),
                        signature: format!("sig-{}", id),
                    })
                    .collect(),
            )
            .await
            .unwrap();
        relay.keys.fetch_bundle(alice, bob).await.unwrap();

        Fixture { relay, alice, bob }
    }

    #[tokio::test]
    async fn offline_recipient_gets_exact_ordered_backlog() {
        let Fixture { relay, alice, bob } = fixture().await;

        // Bob is offline; Alice sends three messages.
        let mut chat_id = None;
        for n in 1..=3u8 {
            let env = relay
                .ingest(alice, bob, chat_id, vec![n; 8])
                .await
                .unwrap();
            chat_id = Some(env.chat_id);
            assert_eq!(env.id, n as u64);
        }
        let chat = chat_id.unwrap();

        // Bob connects: the drain is exactly [1, 2, 3].
        let drained = relay.queue.drain(bob).await.unwrap();
        assert_eq!(drained.iter().map(|e| e.id).collect::<Vec<_>>(), [1, 2, 3]);

        // Bob acks 1 and 2 but not 3, then reconnects: exactly [3].
        relay.handle_ack(bob, chat, 1).await.unwrap();
        relay.handle_ack(bob, chat, 2).await.unwrap();
        let drained = relay.queue.drain(bob).await.unwrap();
        assert_eq!(drained.iter().map(|e| e.id).collect::<Vec<_>>(), [3]);

        // Duplicate ack of 2 is a no-op.
        relay.handle_ack(bob, chat, 2).await.unwrap();
        assert_eq!(relay.queue.drain(bob).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_sends_never_desync_the_pair() {
        let Fixture { relay, alice, bob } = fixture().await;

        // Many valid sends racing on one established pair: none may fail,
        // and none may flag the session out of sync.
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let relay = relay.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    relay.ingest(alice, bob, None, vec![1]).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(
            relay.sessions.health(alice, bob).await,
            Some(crate::sessions::SessionHealth::Active)
        );

        // Every stamp landed: gapless 1..=100.
        let ids: Vec<u64> = relay
            .queue
            .drain(bob)
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, (1..=100).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn live_pushes_arrive_in_chat_order() {
        let Fixture { relay, alice, bob } = fixture().await;

        let (_conn, mut bob_rx) = relay.router.register(bob).await;

        // Bob acks each envelope as it arrives.
        let acker = {
            let relay = relay.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while seen.len() < 10 {
                    match bob_rx.recv().await {
                        Some(PushEvent::NewMessage {
                            envelope_id,
                            chat_id,
                            ..
                        }) => {
                            relay.handle_ack(bob, chat_id, envelope_id).await.unwrap();
                            seen.push(envelope_id);
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                seen
            })
        };

        let mut senders = Vec::new();
        for _ in 0..10 {
            let relay = relay.clone();
            senders.push(tokio::spawn(async move {
                relay.ingest(alice, bob, None, vec![7; 4]).await.unwrap();
            }));
        }
        for sender in senders {
            sender.await.unwrap();
        }

        // Concurrent sends, but the live stream is strictly ascending.
        let seen = acker.await.unwrap();
        assert_eq!(seen, (1..=10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn send_without_session_is_rejected() {
        let Fixture { relay, alice, bob } = fixture().await;
        // Bob never fetched Alice's bundle.
        let err = relay.ingest(bob, alice, None, vec![1]).await.unwrap_err();
        assert!(matches!(err, RelayError::SessionMissing(_)));
    }

    #[tokio::test]
    async fn push_timeout_leaves_envelope_for_next_drain() {
        let Fixture { relay, alice, bob } = fixture().await;

        // Bob is "connected" but his channel never acks.
        let (_conn, mut rx) = relay.router.register(bob).await;

        let env = relay.ingest(alice, bob, None, vec![9]).await.unwrap();
        let err = relay.router.push(&env).await.unwrap_err();
        assert!(matches!(err, RelayError::DeliveryTimeout { .. }));

        // The live push did reach the channel, but without an ack the
        // envelope stays queued for the next drain.
        assert!(rx.recv().await.is_some());
        let drained = relay.queue.drain(bob).await.unwrap();
        assert_eq!(drained.iter().map(|e| e.id).collect::<Vec<_>>(), [env.id]);
    }

    #[tokio::test]
    async fn unissued_ack_desyncs_pair_until_bundle_refetch() {
        let Fixture { relay, alice, bob } = fixture().await;

        let env = relay.ingest(alice, bob, None, vec![1]).await.unwrap();
        let chat = env.chat_id;

        // Bob acks an envelope id the sequencer never issued.
        relay.handle_ack(bob, chat, 99).await.unwrap();

        let err = relay
            .ingest(alice, bob, Some(chat), vec![2])
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::SessionDesync(_)));

        // A fresh bundle fetch re-establishes the pair and sends resume.
        // The rejected send was refused before stamping, so no gap appears.
        relay.keys.fetch_bundle(alice, bob).await.unwrap();
        let env = relay.ingest(alice, bob, Some(chat), vec![2]).await.unwrap();
        assert_eq!(env.id, 2);
    }

    #[tokio::test]
    async fn delivery_receipt_reaches_the_sender() {
        let Fixture { relay, alice, bob } = fixture().await;

        let env = relay.ingest(alice, bob, None, vec![1]).await.unwrap();

        let (_conn, mut alice_rx) = relay.router.register(alice).await;
        relay.handle_ack(bob, env.chat_id, env.id).await.unwrap();

        match alice_rx.recv().await.unwrap() {
            PushEvent::Receipt { status, envelope_id, .. } => {
                assert_eq!(status, ReceiptStatus::Delivered);
                assert_eq!(envelope_id, env.id);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // READ after DELIVERED advances; a second READ is ignored.
        relay.handle_read(bob, env.chat_id, env.id).await.unwrap();
        match alice_rx.recv().await.unwrap() {
            PushEvent::Receipt { status, .. } => assert_eq!(status, ReceiptStatus::Read),
            other => panic!("unexpected event: {:?}", other),
        }
        relay.handle_read(bob, env.chat_id, env.id).await.unwrap();
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_before_ack_never_regresses_the_receipt() {
        let Fixture { relay, alice, bob } = fixture().await;
        let env = relay.ingest(alice, bob, None, vec![1]).await.unwrap();

        let (_conn, mut alice_rx) = relay.router.register(alice).await;

        // Bob reads before acking.
        relay.handle_read(bob, env.chat_id, env.id).await.unwrap();
        match alice_rx.recv().await.unwrap() {
            PushEvent::Receipt { status, .. } => assert_eq!(status, ReceiptStatus::Read),
            other => panic!("unexpected event: {:?}", other),
        }

        // The late ack still purges the envelope, but the sender must not
        // see DELIVERED after READ.
        relay.handle_ack(bob, env.chat_id, env.id).await.unwrap();
        assert!(relay.queue.drain(bob).await.unwrap().is_empty());
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wrong_chat_membership_is_rejected() {
        let Fixture { relay, alice, bob } = fixture().await;
        let env = relay.ingest(alice, bob, None, vec![1]).await.unwrap();

        let mallory = Uuid::new_v4();
        let err = relay
            .ingest(alice, mallory, Some(env.chat_id), vec![2])
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotChatMember(_)));
    }
}
