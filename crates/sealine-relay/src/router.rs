use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand::Rng;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use sealine_types::error::RelayError;
use sealine_types::events::PushEvent;
use sealine_types::models::Envelope;

/// Maps connected recipients to live transport channels and pushes events
/// to them. One channel per recipient: a new connection evicts and closes
/// the prior one — last-writer-wins for presence, never for messages (the
/// pending queue is the source of truth).
#[derive(Clone)]
pub struct DeliveryRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    /// recipient -> (conn_id, sender). The conn_id guards unregistration so
    /// a stale connection cannot tear down its successor.
    channels: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<PushEvent>)>>,

    /// Live pushes awaiting a client ack, keyed (recipient, chat, envelope).
    pending_acks: Mutex<HashMap<(Uuid, Uuid, u64), oneshot::Sender<()>>>,

    /// recipient -> ordered live-push queue, drained by one worker task per
    /// recipient. Workers live for the process; one entry per recipient
    /// ever pushed to, never evicted.
    push_queues: RwLock<HashMap<Uuid, mpsc::UnboundedSender<Envelope>>>,

    ack_timeout: Duration,
}

impl DeliveryRouter {
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                channels: RwLock::new(HashMap::new()),
                pending_acks: Mutex::new(HashMap::new()),
                push_queues: RwLock::new(HashMap::new()),
                ack_timeout,
            }),
        }
    }

    /// Register the live channel for a recipient, evicting any prior one.
    /// Returns (conn_id, receiver); dropping the evicted sender ends the
    /// old connection's send loop, which closes its socket.
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<PushEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let evicted = self
            .inner
            .channels
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        if evicted.is_some() {
            debug!("Evicted prior connection for {}", user_id);
        }
        (conn_id, rx)
    }

    /// Unregister a channel, but only if conn_id still owns it.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) {
        let mut channels = self.inner.channels.write().await;
        if let Some((stored_conn_id, _)) = channels.get(&user_id) {
            if *stored_conn_id == conn_id {
                channels.remove(&user_id);
            }
        }
    }

    pub async fn is_connected(&self, user_id: Uuid) -> bool {
        self.inner.channels.read().await.contains_key(&user_id)
    }

    /// Send a non-envelope event (receipt, replenish request) to a user if
    /// connected. Returns whether a channel accepted it.
    pub async fn send_event(&self, user_id: Uuid, event: PushEvent) -> bool {
        let channels = self.inner.channels.read().await;
        match channels.get(&user_id) {
            Some((_, tx)) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Push an envelope to its recipient and await the client ack up to the
    /// configured timeout. Not-connected and timed-out pushes both leave the
    /// envelope in the pending queue — no message is ever dropped on push
    /// failure, so `DeliveryTimeout` is internal bookkeeping only.
    pub async fn push(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let recipient = envelope.recipient_id;
        let key = (recipient, envelope.chat_id, envelope.id);

        let sent = {
            let channels = self.inner.channels.read().await;
            match channels.get(&recipient) {
                None => return Ok(()), // offline; queued for next drain
                Some((_, tx)) => {
                    let (ack_tx, ack_rx) = oneshot::channel();
                    self.inner.pending_acks.lock().await.insert(key, ack_tx);
                    if tx.send(new_message_event(envelope)).is_err() {
                        None
                    } else {
                        Some(ack_rx)
                    }
                }
            }
        };

        let Some(ack_rx) = sent else {
            // Channel died between lookup and send; treated as offline.
            self.inner.pending_acks.lock().await.remove(&key);
            return Ok(());
        };

        match tokio::time::timeout(self.inner.ack_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            // Timeout, or the waiting slot was dropped with the connection.
            _ => {
                self.inner.pending_acks.lock().await.remove(&key);
                Err(RelayError::DeliveryTimeout {
                    recipient_id: recipient,
                    envelope_id: envelope.id,
                })
            }
        }
    }

    /// Complete a pending push wait when the client acks. Safe to call for
    /// envelopes with no waiter (drain replays, duplicate acks).
    pub async fn resolve_ack(&self, recipient_id: Uuid, chat_id: Uuid, envelope_id: u64) {
        let waiter = self
            .inner
            .pending_acks
            .lock()
            .await
            .remove(&(recipient_id, chat_id, envelope_id));
        if let Some(tx) = waiter {
            let _ = tx.send(());
        }
    }

    /// Hand an envelope to the recipient's ordered push worker. The worker
    /// pushes one envelope at a time in hand-off order, so a connected
    /// client never observes envelope N+1 before N for the same chat (the
    /// caller hands off under the chat's sequencer guard). An offline
    /// recipient makes each push a cheap no-op.
    pub async fn enqueue_push(&self, envelope: Envelope, retry_max: u32) {
        let recipient = envelope.recipient_id;
        {
            let queues = self.inner.push_queues.read().await;
            if let Some(tx) = queues.get(&recipient) {
                // Workers never exit, so the channel cannot be closed.
                let _ = tx.send(envelope);
                return;
            }
        }

        let mut queues = self.inner.push_queues.write().await;
        let tx = queues.entry(recipient).or_insert_with(|| {
            let router = self.clone();
            let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
            tokio::spawn(async move {
                while let Some(env) = rx.recv().await {
                    router.push_with_retry(env, retry_max).await;
                }
            });
            tx
        });
        let _ = tx.send(envelope);
    }

    /// Supervised live-push retry: bounded exponential backoff with jitter,
    /// stopping as soon as the recipient disconnects (the next drain takes
    /// over). The envelope stays queued throughout, so giving up here loses
    /// nothing.
    pub async fn push_with_retry(&self, envelope: Envelope, max_attempts: u32) {
        for attempt in 0..max_attempts.max(1) {
            match self.push(&envelope).await {
                Ok(()) => return,
                Err(RelayError::DeliveryTimeout { .. }) => {
                    if !self.is_connected(envelope.recipient_id).await {
                        return;
                    }
                    warn!(
                        "Push of envelope {}/{} to {} timed out (attempt {})",
                        envelope.chat_id,
                        envelope.id,
                        envelope.recipient_id,
                        attempt + 1
                    );
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(e) => {
                    warn!("Push of envelope {}/{} failed: {}", envelope.chat_id, envelope.id, e);
                    return;
                }
            }
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        self.inner.ack_timeout
    }
}

/// Exponential backoff with jitter: 1s, 2s, 4s, ... capped at 30s, each
/// scaled by a random factor in [0.5, 1.5).
fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1 << attempt.min(5)).min(Duration::from_secs(30));
    let jitter: f64 = rand::rng().random_range(0.5..1.5);
    base.mul_f64(jitter)
}

pub(crate) fn new_message_event(envelope: &Envelope) -> PushEvent {
    PushEvent::NewMessage {
        envelope_id: envelope.id,
        chat_id: envelope.chat_id,
        sender_id: envelope.sender_id,
        ciphertext: B64.encode(&envelope.ciphertext),
        server_timestamp: envelope.created_at,
    }
}
