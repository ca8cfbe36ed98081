use std::time::Duration;

use cdp_adapter::{LogEntry, SessionEvent};
use feed_patch::codec::encode_line;
use feed_patch::{ArgValue, EventRelay, MessageKind, PatchPrefix, RelayEvent};
use feedtap_event_bus::{to_mpsc, InMemoryBus};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

fn side_channel(prefix: &PatchPrefix, kind: MessageKind, payload: serde_json::Value) -> SessionEvent {
    SessionEvent::Console(LogEntry::new("debug", vec![encode_line(prefix, kind, &payload)]))
}

#[tokio::test]
async fn relays_side_channel_messages_in_order() {
    let prefix = PatchPrefix::generate();
    let (tx, rx) = broadcast::channel(32);
    let bus = InMemoryBus::<RelayEvent>::new(32);
    let mut out = to_mpsc(bus.clone(), 32);
    let relay = EventRelay::spawn(rx, prefix.clone(), bus.clone());

    let sent = [
        side_channel(&prefix, MessageKind::Init, json!({ "room": "alice" })),
        SessionEvent::Console(LogEntry::new("log", vec!["page noise".into()])),
        SessionEvent::PageLoaded,
        side_channel(&prefix, MessageKind::Open, json!(null)),
        side_channel(
            &prefix,
            MessageKind::Message,
            json!({ "type": "message", "method": "onRoomMsg", "args": ["alice", "25"] }),
        ),
        side_channel(&prefix, MessageKind::Message, json!({ "type": "ping" })),
        SessionEvent::Console(LogEntry::new(
            "debug",
            vec![format!("{prefix}{}", json!({ "type": "message", "payload": { "type": "message", "method": "onTip", "args": [] } }))],
        )),
        side_channel(&prefix, MessageKind::Close, json!({ "code": 1000 })),
    ];
    for event in sent {
        tx.send(event).expect("send");
    }

    let mut received = Vec::new();
    for _ in 0..5 {
        let event = timeout(Duration::from_secs(1), out.recv())
            .await
            .expect("in time")
            .expect("event");
        received.push(event);
    }

    assert!(matches!(&received[0], RelayEvent::Init(s) if s.room.as_deref() == Some("alice")));
    assert_eq!(received[1], RelayEvent::Opened);
    match &received[2] {
        RelayEvent::Feed(feed) => {
            assert_eq!(feed.method, "onRoomMsg");
            assert_eq!(
                feed.args,
                vec![ArgValue::Text("alice".into()), ArgValue::Number(25.0)]
            );
        }
        other => panic!("unexpected {other:?}"),
    }
    // bare tag form is accepted too
    assert!(matches!(&received[3], RelayEvent::Feed(feed) if feed.method == "onTip"));
    assert!(matches!(&received[4], RelayEvent::Closed(close) if close.code == Some(1000)));

    tx.send(SessionEvent::Disconnected {
        reason: "gone".into(),
    })
    .expect("send");
    timeout(Duration::from_secs(1), relay.stop())
        .await
        .expect("relay stops");
}

#[tokio::test]
async fn foreign_prefix_is_ignored() {
    let (tx, rx) = broadcast::channel(8);
    let bus = InMemoryBus::<RelayEvent>::new(8);
    let mut out = to_mpsc(bus.clone(), 8);
    let relay = EventRelay::spawn(rx, PatchPrefix::new("__mine__:"), bus.clone());

    tx.send(side_channel(
        &PatchPrefix::new("__other__:"),
        MessageKind::Open,
        json!(null),
    ))
    .expect("send");
    tx.send(side_channel(&PatchPrefix::new("__mine__:"), MessageKind::Open, json!(null)))
        .expect("send");

    let first = timeout(Duration::from_secs(1), out.recv())
        .await
        .expect("in time");
    assert_eq!(first, Some(RelayEvent::Opened));
    relay.stop().await;
}
