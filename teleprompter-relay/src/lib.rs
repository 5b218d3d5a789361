//! Teleprompter Relay Server Library
//!
//! One controller and one display may be connected at a time. The `Relay`
//! owns both connection slots and is the only place they are read or written;
//! the binary and the integration tests drive it through the same routes.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;
use warp::ws::Message;

use teleprompter_proto::message::POSITION_UPDATE;
use teleprompter_proto::{now_millis, InboundMessage, LinkState, Role, ServerMessage};

pub mod config;
pub mod connection;
pub mod routes;

pub use config::{DeployMode, RelayConfig};
pub use connection::client_connection;
pub use routes::routes;

/// Channel buffer size - prevents unbounded memory growth
pub const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Heartbeat interval in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Connection timeout after missed heartbeats
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 90;

/// Ping cadence and the silence after which a connection is dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    pub interval: Duration,
    /// Any frame, pongs included, resets this
    pub idle_timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            idle_timeout: Duration::from_secs(HEARTBEAT_TIMEOUT_SECS),
        }
    }
}

/// Close code sent when a role is already taken (policy violation).
pub const CLOSE_ALREADY_CONNECTED: u16 = 1008;

pub type Tx = mpsc::Sender<Message>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{role} already connected")]
pub struct AdmissionConflict {
    pub role: Role,
}

impl AdmissionConflict {
    pub fn close_reason(&self) -> &'static str {
        match self.role {
            Role::Controller => "Controller already connected",
            Role::Display => "Display already connected",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Relayed copy queued for the peer
    Forwarded,
    /// The routing table has no entry for this source and type
    NotRouted,
    /// Peer is open but its outbound queue is full; message dropped
    Dropped,
    /// Peer slot empty or its connection already gone
    TargetUnavailable { sender_notified: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub controller: LinkState,
    pub display: LinkState,
    /// Connections that named no recognised role
    pub unknown: usize,
}

impl RelayStatus {
    pub fn connected_roles(&self) -> usize {
        [self.controller, self.display]
            .iter()
            .filter(|s| **s == LinkState::Connected)
            .count()
    }
}

struct Endpoint {
    id: ConnectionId,
    tx: Tx,
}

#[derive(Default)]
struct Slots {
    controller: Option<Endpoint>,
    display: Option<Endpoint>,
    unknown: HashSet<ConnectionId>,
}

impl Slots {
    fn slot(&self, role: Role) -> &Option<Endpoint> {
        match role {
            Role::Controller => &self.controller,
            Role::Display => &self.display,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<Endpoint> {
        match role {
            Role::Controller => &mut self.controller,
            Role::Display => &mut self.display,
        }
    }

    fn broadcast_status(&self) {
        let status =
            ServerMessage::connection_status(self.controller.is_some(), self.display.is_some());
        for endpoint in [&self.controller, &self.display].into_iter().flatten() {
            let _ = send_server_message(&endpoint.tx, &status);
        }
    }
}

/// Queue a frame without waiting. Sends never block while slot state is locked;
/// the connection's writer task does the socket I/O.
fn send_frame(tx: &Tx, msg: Message) -> Result<(), TrySendError<Message>> {
    let result = tx.try_send(msg);
    if let Err(TrySendError::Full(_)) = &result {
        log::warn!("Dropping outbound message: channel full (backpressure)");
    }
    result
}

fn send_server_message(tx: &Tx, msg: &ServerMessage) -> Result<(), TrySendError<Message>> {
    match msg.to_json() {
        Ok(json) => send_frame(tx, Message::text(json)),
        Err(e) => {
            log::error!("failed to encode server message: {e}");
            Ok(())
        }
    }
}

/// Owns the controller and display slots. All reads and writes of slot
/// occupancy, and every routing decision, happen under one lock.
#[derive(Default)]
pub struct Relay {
    slots: Mutex<Slots>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `tx` into the slot for `role`.
    ///
    /// On success the candidate gets a welcome and every bound endpoint gets a
    /// fresh connection status. If the slot is taken, the candidate gets one
    /// `ALREADY_CONNECTED` error followed by a close frame and the incumbent is
    /// left alone. Connections without a role are tracked and welcomed but
    /// never bound to a slot.
    pub async fn admit(
        &self,
        id: ConnectionId,
        role: Option<Role>,
        tx: Tx,
    ) -> Result<(), AdmissionConflict> {
        let mut slots = self.slots.lock().await;

        let Some(role) = role else {
            slots.unknown.insert(id);
            let _ = send_server_message(&tx, &ServerMessage::welcome(None));
            log::info!("Client registered as unknown id={}", id);
            return Ok(());
        };

        let slot = slots.slot_mut(role);
        if slot.is_some() {
            log::warn!("Rejecting {} connection id={}: slot occupied", role, id);
            let conflict = AdmissionConflict { role };
            let _ = send_server_message(&tx, &ServerMessage::already_connected(role));
            let _ = send_frame(
                &tx,
                Message::close_with(CLOSE_ALREADY_CONNECTED, conflict.close_reason()),
            );
            return Err(conflict);
        }

        let _ = send_server_message(&tx, &ServerMessage::welcome(Some(role)));
        *slot = Some(Endpoint { id, tx });
        slots.broadcast_status();

        log::info!(
            "Client registered as {} id={} (controller={}, display={})",
            role,
            id,
            slots.controller.is_some(),
            slots.display.is_some()
        );
        Ok(())
    }

    /// Forward `msg` from `source` according to the fixed routing table:
    /// controller -> display for every type, display -> controller for
    /// `positionUpdate` only.
    ///
    /// A controller whose display is absent is told so; a display whose
    /// controller is absent is not.
    pub async fn route(&self, source: Option<Role>, msg: &InboundMessage) -> RouteOutcome {
        let Some(source) = source else {
            return RouteOutcome::NotRouted;
        };
        if source == Role::Display && msg.kind() != POSITION_UPDATE {
            return RouteOutcome::NotRouted;
        }
        let target = source.peer();

        let slots = self.slots.lock().await;
        let sent = match slots.slot(target) {
            Some(peer) if !peer.tx.is_closed() => Some(send_frame(
                &peer.tx,
                Message::text(msg.relayed(now_millis()).to_string()),
            )),
            _ => None,
        };

        match sent {
            Some(Ok(())) => {
                log::debug!("Forwarded {} message: {} -> {}", msg.kind(), source, target);
                RouteOutcome::Forwarded
            }
            Some(Err(TrySendError::Full(_))) => RouteOutcome::Dropped,
            Some(Err(TrySendError::Closed(_))) | None => {
                log::info!("Cannot forward {} message: {} not connected", msg.kind(), target);
                let sender_notified = source == Role::Controller;
                if sender_notified {
                    if let Some(src) = slots.slot(source) {
                        let _ = send_server_message(&src.tx, &ServerMessage::peer_unavailable(target));
                    }
                }
                RouteOutcome::TargetUnavailable { sender_notified }
            }
        }
    }

    /// Release the slot held by connection `id`, if it still holds it, and
    /// tell whoever remains. Returns whether a slot was freed.
    pub async fn on_close(&self, id: ConnectionId, role: Option<Role>) -> bool {
        let mut slots = self.slots.lock().await;

        let Some(role) = role else {
            slots.unknown.remove(&id);
            return false;
        };

        let slot = slots.slot_mut(role);
        if !slot.as_ref().is_some_and(|endpoint| endpoint.id == id) {
            return false;
        }
        *slot = None;
        slots.broadcast_status();
        true
    }

    pub async fn status(&self) -> RelayStatus {
        let slots = self.slots.lock().await;
        RelayStatus {
            controller: LinkState::from_occupied(slots.controller.is_some()),
            display: LinkState::from_occupied(slots.display.is_some()),
            unknown: slots.unknown.len(),
        }
    }
}
