use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use sealine_types::events::{ClientFrame, PushEvent};

use crate::Relay;
use crate::router::new_message_event;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a pre-authenticated WebSocket connection. The JWT was validated
/// at the HTTP upgrade layer, so the socket goes straight to Ready, backlog
/// replay, then the event loop.
pub async fn handle_connection(socket: WebSocket, relay: Relay, user_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} connected to relay", user_id);

    let ready = PushEvent::Ready { user_id };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Exhaustion check on connect: a client running low on one-time keys is
    // told to upload more before anyone else hits KeyExhausted against it.
    match relay.keys.replenish_hint(user_id).await {
        Ok(Some(remaining)) => {
            let event = PushEvent::ReplenishRequested { remaining };
            if sender
                .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
                .await
                .is_err()
            {
                return;
            }
        }
        Ok(None) => {}
        Err(e) => warn!("Replenish check for {} failed: {}", user_id, e),
    }

    // Register before draining: anything ingested from here on reaches the
    // live channel, and overlap with the drain only produces duplicates,
    // which clients deduplicate by envelope id.
    let (conn_id, mut user_rx) = relay.router.register(user_id).await;

    // Backlog replay in ascending (chat, id) order, before any new traffic
    // for this recipient. Envelopes stay queued until explicitly acked.
    let backlog = match relay.queue.drain(user_id).await {
        Ok(backlog) => backlog,
        Err(e) => {
            warn!("Drain for {} failed: {}", user_id, e);
            relay.router.unregister(user_id, conn_id).await;
            return;
        }
    };
    if !backlog.is_empty() {
        info!("Replaying {} queued envelopes to {}", backlog.len(), user_id);
    }
    for envelope in &backlog {
        let event = new_message_event(envelope);
        if sender
            .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
            .await
            .is_err()
        {
            relay.router.unregister(user_id, conn_id).await;
            return;
        }
    }

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward targeted pushes -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        // Channel dropped: evicted by a newer connection.
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read frames from client
    let relay_recv = relay.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => handle_frame(&relay_recv, user_id, frame).await,
                    Err(e) => {
                        warn!(
                            "{} bad frame: {} -- raw: {}",
                            user_id,
                            e,
                            log_snippet(&text)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    relay.router.unregister(user_id, conn_id).await;
    info!("{} disconnected from relay", user_id);
}

/// First ~200 bytes of a frame for the log, clamped to a char boundary so
/// multi-byte input cannot panic the slice.
fn log_snippet(s: &str) -> &str {
    if s.len() <= 200 {
        return s;
    }
    let mut end = 200;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

async fn handle_frame(relay: &Relay, user_id: Uuid, frame: ClientFrame) {
    match frame {
        ClientFrame::Ack {
            chat_id,
            envelope_id,
        } => {
            if let Err(e) = relay.handle_ack(user_id, chat_id, envelope_id).await {
                warn!(
                    "Ack {}/{} from {} failed: {}",
                    chat_id, envelope_id, user_id, e
                );
            }
        }
        ClientFrame::Read {
            chat_id,
            envelope_id,
        } => {
            if let Err(e) = relay.handle_read(user_id, chat_id, envelope_id).await {
                warn!(
                    "Read receipt {}/{} from {} failed: {}",
                    chat_id, envelope_id, user_id, e
                );
            }
        }
    }
}
