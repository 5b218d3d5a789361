use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use warp::ws::{Message, WebSocket};

use teleprompter_proto::{InboundMessage, Role};

use crate::{ConnectionId, Heartbeat, Relay, RouteOutcome, CHANNEL_BUFFER_SIZE};

/// Drive one upgraded client socket from admission until it goes away.
///
/// A transport error, a close frame and a heartbeat timeout all end the
/// connection the same way: its slot is released through `Relay::on_close`.
pub async fn client_connection(
    ws: WebSocket,
    role: Option<Role>,
    relay: Arc<Relay>,
    heartbeat: Heartbeat,
) {
    let id = ConnectionId::new();
    let label = Role::label(role);
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(CHANNEL_BUFFER_SIZE);

    if let Err(conflict) = relay.admit(id, role, out_tx.clone()).await {
        log::warn!("Connection id={} rejected: {}", id, conflict);
        // Flush the error notification and close frame queued by the relay.
        drop(out_tx);
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        return;
    }

    let writer = tokio::task::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let heartbeat_tx = out_tx;
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = interval(heartbeat.interval);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(Message::ping(Vec::new())).await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg = match timeout(heartbeat.idle_timeout, ws_rx.next()).await {
            Ok(Some(Ok(m))) => m,
            Ok(Some(Err(e))) => {
                log::warn!("{} id={} transport error: {}", label, id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                log::warn!("{} id={} timed out (no heartbeat)", label, id);
                break;
            }
        };

        if msg.is_close() {
            if let Some((code, reason)) = msg.close_frame() {
                log::info!("{} id={} closed: {} - {}", label, id, code, reason);
            }
            break;
        }
        if !(msg.is_text() || msg.is_binary()) {
            continue;
        }

        let parsed = match InboundMessage::parse(msg.as_bytes()) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("Dropping malformed message from {} id={}: {}", label, id, e);
                continue;
            }
        };

        match relay.route(role, &parsed).await {
            RouteOutcome::Forwarded | RouteOutcome::NotRouted => {}
            RouteOutcome::Dropped => {
                log::warn!("Dropped {} message from {} id={}", parsed.kind(), label, id);
            }
            RouteOutcome::TargetUnavailable { sender_notified } => {
                log::debug!(
                    "{} message from {} id={} undeliverable (sender notified: {})",
                    parsed.kind(),
                    label,
                    id,
                    sender_notified
                );
            }
        }
    }

    heartbeat_handle.abort();
    relay.on_close(id, role).await;
    writer.abort();
    log::info!("{} disconnected id={}", label, id);
}
