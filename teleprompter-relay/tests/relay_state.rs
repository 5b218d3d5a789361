//! State machine tests for the relay coordinator, driven with in-memory
//! channels instead of sockets.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use warp::ws::Message;

use teleprompter_proto::{InboundMessage, LinkState, Role};
use teleprompter_relay::{
    AdmissionConflict, ConnectionId, Relay, RouteOutcome, CLOSE_ALREADY_CONNECTED,
};

struct Peer {
    id: ConnectionId,
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
}

impl Peer {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            id: ConnectionId::new(),
            tx,
            rx,
        }
    }

    /// Everything queued so far.
    fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn drain_json(&mut self) -> Vec<Value> {
        self.drain()
            .into_iter()
            .map(|m| serde_json::from_str(m.to_str().expect("text frame")).unwrap())
            .collect()
    }
}

async fn admitted(relay: &Relay, role: Option<Role>) -> Peer {
    let mut peer = Peer::new();
    relay
        .admit(peer.id, role, peer.tx.clone())
        .await
        .expect("slot should be free");
    peer.drain();
    peer
}

fn inbound(raw: &str) -> InboundMessage {
    InboundMessage::parse(raw.as_bytes()).unwrap()
}

#[tokio::test]
async fn test_admit_sends_welcome_then_status() {
    let relay = Relay::new();
    let mut controller = Peer::new();

    relay
        .admit(controller.id, Some(Role::Controller), controller.tx.clone())
        .await
        .unwrap();

    let msgs = controller.drain_json();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0]["type"], "welcome");
    assert_eq!(msgs[0]["role"], "controller");
    assert_eq!(msgs[1]["type"], "connectionStatus");
    assert_eq!(msgs[1]["controller"], "connected");
    assert_eq!(msgs[1]["display"], "disconnected");
}

#[tokio::test]
async fn test_second_role_broadcasts_status_to_both() {
    let relay = Relay::new();
    let mut controller = admitted(&relay, Some(Role::Controller)).await;
    let mut display = Peer::new();

    relay
        .admit(display.id, Some(Role::Display), display.tx.clone())
        .await
        .unwrap();

    let to_controller = controller.drain_json();
    assert_eq!(to_controller.len(), 1);
    assert_eq!(to_controller[0]["type"], "connectionStatus");
    assert_eq!(to_controller[0]["controller"], "connected");
    assert_eq!(to_controller[0]["display"], "connected");

    let to_display = display.drain_json();
    assert_eq!(to_display.len(), 2);
    assert_eq!(to_display[0]["type"], "welcome");
    assert_eq!(to_display[1]["controller"], "connected");
    assert_eq!(to_display[1]["display"], "connected");
}

#[tokio::test]
async fn test_duplicate_role_is_rejected_and_incumbent_untouched() {
    let relay = Relay::new();
    let mut incumbent = admitted(&relay, Some(Role::Display)).await;
    let mut candidate = Peer::new();

    let result = relay
        .admit(candidate.id, Some(Role::Display), candidate.tx.clone())
        .await;
    assert_eq!(
        result,
        Err(AdmissionConflict {
            role: Role::Display
        })
    );

    let msgs = candidate.drain();
    assert_eq!(msgs.len(), 2);
    let error: Value = serde_json::from_str(msgs[0].to_str().unwrap()).unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "ALREADY_CONNECTED");
    assert_eq!(
        msgs[1].close_frame(),
        Some((CLOSE_ALREADY_CONNECTED, "Display already connected"))
    );

    assert!(incumbent.drain().is_empty());

    // the incumbent is still the one routed to
    let _controller = admitted(&relay, Some(Role::Controller)).await;
    incumbent.drain();
    relay
        .route(Some(Role::Controller), &inbound(r#"{"type":"cue"}"#))
        .await;
    assert_eq!(incumbent.drain_json().len(), 1);
    assert!(candidate.drain().is_empty());
}

#[tokio::test]
async fn test_controller_rejection_reason() {
    let relay = Relay::new();
    let _incumbent = admitted(&relay, Some(Role::Controller)).await;
    let mut candidate = Peer::new();

    let conflict = relay
        .admit(candidate.id, Some(Role::Controller), candidate.tx.clone())
        .await
        .unwrap_err();

    assert_eq!(conflict.close_reason(), "Controller already connected");
    let msgs = candidate.drain();
    assert_eq!(
        msgs[1].close_frame(),
        Some((CLOSE_ALREADY_CONNECTED, "Controller already connected"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admissions_bind_exactly_one() {
    let relay = Arc::new(Relay::new());
    let mut handles = Vec::new();
    let mut receivers = Vec::new();

    for _ in 0..32 {
        let peer = Peer::new();
        let relay = relay.clone();
        let (id, tx) = (peer.id, peer.tx.clone());
        receivers.push(peer);
        handles.push(tokio::spawn(async move {
            relay.admit(id, Some(Role::Display), tx).await
        }));
    }

    let mut bound = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            bound += 1;
        }
    }
    assert_eq!(bound, 1);
    assert_eq!(relay.status().await.display, LinkState::Connected);
}

#[tokio::test]
async fn test_controller_messages_forwarded_with_metadata() {
    let relay = Relay::new();
    let _controller = admitted(&relay, Some(Role::Controller)).await;
    let mut display = admitted(&relay, Some(Role::Display)).await;

    let outcome = relay
        .route(Some(Role::Controller), &inbound(r#"{"type":"cue","text":"go"}"#))
        .await;
    assert_eq!(outcome, RouteOutcome::Forwarded);

    let mut msgs = display.drain_json();
    assert_eq!(msgs.len(), 1);
    let relayed = msgs.remove(0);
    assert!(relayed["timestamp"].is_i64());
    let mut without_ts = relayed.clone();
    without_ts.as_object_mut().unwrap().remove("timestamp");
    assert_eq!(
        without_ts,
        json!({"type": "cue", "text": "go", "forwarded": true})
    );
}

#[tokio::test]
async fn test_display_forwards_only_position_updates() {
    let relay = Relay::new();
    let mut controller = admitted(&relay, Some(Role::Controller)).await;
    let _display = admitted(&relay, Some(Role::Display)).await;
    controller.drain();

    let outcome = relay
        .route(Some(Role::Display), &inbound(r#"{"type":"cue"}"#))
        .await;
    assert_eq!(outcome, RouteOutcome::NotRouted);
    assert!(controller.drain().is_empty());

    let outcome = relay
        .route(
            Some(Role::Display),
            &inbound(r#"{"type":"positionUpdate","pos":42}"#),
        )
        .await;
    assert_eq!(outcome, RouteOutcome::Forwarded);

    let msgs = controller.drain_json();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0]["type"], "positionUpdate");
    assert_eq!(msgs[0]["pos"], 42);
    assert_eq!(msgs[0]["forwarded"], true);
}

#[tokio::test]
async fn test_controller_told_when_display_missing() {
    let relay = Relay::new();
    let mut controller = admitted(&relay, Some(Role::Controller)).await;

    let outcome = relay
        .route(Some(Role::Controller), &inbound(r#"{"type":"cue"}"#))
        .await;
    assert_eq!(
        outcome,
        RouteOutcome::TargetUnavailable {
            sender_notified: true
        }
    );

    let msgs = controller.drain_json();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0]["type"], "error");
    assert_eq!(msgs[0]["message"], "display not connected");
    assert!(msgs[0].get("code").is_none());
    assert!(msgs[0]["timestamp"].is_i64());
}

#[tokio::test]
async fn test_display_not_told_when_controller_missing() {
    let relay = Relay::new();
    let mut display = admitted(&relay, Some(Role::Display)).await;

    let outcome = relay
        .route(Some(Role::Display), &inbound(r#"{"type":"positionUpdate","pos":1}"#))
        .await;
    assert_eq!(
        outcome,
        RouteOutcome::TargetUnavailable {
            sender_notified: false
        }
    );
    assert!(display.drain().is_empty());
}

#[tokio::test]
async fn test_closed_peer_counts_as_unavailable() {
    let relay = Relay::new();
    let mut controller = admitted(&relay, Some(Role::Controller)).await;
    let display = admitted(&relay, Some(Role::Display)).await;
    controller.drain();

    // writer side gone, close not processed yet
    drop(display.rx);

    let outcome = relay
        .route(Some(Role::Controller), &inbound(r#"{"type":"cue"}"#))
        .await;
    assert_eq!(
        outcome,
        RouteOutcome::TargetUnavailable {
            sender_notified: true
        }
    );
    assert_eq!(controller.drain_json()[0]["type"], "error");
}

#[tokio::test]
async fn test_close_frees_slot_and_notifies_remaining() {
    let relay = Relay::new();
    let controller = admitted(&relay, Some(Role::Controller)).await;
    let mut display = admitted(&relay, Some(Role::Display)).await;

    assert!(relay.on_close(controller.id, Some(Role::Controller)).await);

    let msgs = display.drain_json();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0]["type"], "connectionStatus");
    assert_eq!(msgs[0]["controller"], "disconnected");
    assert_eq!(msgs[0]["display"], "connected");

    let mut replacement = Peer::new();
    relay
        .admit(replacement.id, Some(Role::Controller), replacement.tx.clone())
        .await
        .expect("freed slot accepts a new controller");
    assert_eq!(replacement.drain_json()[0]["type"], "welcome");
}

#[tokio::test]
async fn test_stale_close_does_not_clear_incumbent() {
    let relay = Relay::new();
    let mut incumbent = admitted(&relay, Some(Role::Display)).await;
    let candidate = Peer::new();
    let _ = relay
        .admit(candidate.id, Some(Role::Display), candidate.tx.clone())
        .await;

    assert!(!relay.on_close(candidate.id, Some(Role::Display)).await);

    assert_eq!(relay.status().await.display, LinkState::Connected);
    assert!(incumbent.drain().is_empty());
}

#[tokio::test]
async fn test_unknown_role_is_tracked_but_never_routed() {
    let relay = Relay::new();
    let mut display = admitted(&relay, Some(Role::Display)).await;
    let mut unknown = Peer::new();

    relay.admit(unknown.id, None, unknown.tx.clone()).await.unwrap();

    let msgs = unknown.drain_json();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0]["type"], "welcome");
    assert_eq!(msgs[0]["role"], "unknown");
    // no slot changed, nobody hears about it
    assert!(display.drain().is_empty());
    assert_eq!(relay.status().await.unknown, 1);

    let outcome = relay.route(None, &inbound(r#"{"type":"cue"}"#)).await;
    assert_eq!(outcome, RouteOutcome::NotRouted);
    assert!(display.drain().is_empty());

    // a second unknown client is fine too
    let other = Peer::new();
    relay.admit(other.id, None, other.tx.clone()).await.unwrap();
    assert_eq!(relay.status().await.unknown, 2);

    assert!(!relay.on_close(unknown.id, None).await);
    assert_eq!(relay.status().await.unknown, 1);
    assert!(display.drain().is_empty());
}

#[tokio::test]
async fn test_status_snapshot() {
    let relay = Relay::new();
    let status = relay.status().await;
    assert_eq!(status.controller, LinkState::Disconnected);
    assert_eq!(status.display, LinkState::Disconnected);
    assert_eq!(status.connected_roles(), 0);

    let _controller = admitted(&relay, Some(Role::Controller)).await;
    let status = relay.status().await;
    assert_eq!(status.controller, LinkState::Connected);
    assert_eq!(status.connected_roles(), 1);
}
