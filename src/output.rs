//! Rendering of relay events and DOM insertions for the terminal.

use cdp_adapter::NodeInserted;
use feed_patch::{ArgValue, RelayEvent};
use serde_json::json;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

pub fn render_event(event: &RelayEvent, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string(event).unwrap_or_else(|err| json!({ "error": err.to_string() }).to_string())
        }
        OutputFormat::Human => human(event),
    }
}

pub fn render_node(node: &NodeInserted, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => json!({
            "event": "node_inserted",
            "data": {
                "nodeId": node.node_id,
                "parentNodeId": node.parent_node_id,
                "previousNodeId": node.previous_node_id,
                "html": node.html,
            }
        })
        .to_string(),
        OutputFormat::Human => format!("[dom] #{} under #{}: {}", node.node_id, node.parent_node_id, node.html),
    }
}

fn human(event: &RelayEvent) -> String {
    match event {
        RelayEvent::Init(snapshot) => format!(
            "[init] room={} websocket={} player={}",
            snapshot.room.as_deref().unwrap_or("-"),
            snapshot.has_websocket,
            snapshot.has_player
        ),
        RelayEvent::Hooked(snapshot) => format!(
            "[hooked] room={}",
            snapshot.room.as_deref().unwrap_or("-")
        ),
        RelayEvent::Opened => "[open]".to_string(),
        RelayEvent::Feed(feed) => {
            let args: Vec<String> = feed.args.iter().map(arg_text).collect();
            format!("[{}] {}", feed.method, args.join(" | "))
        }
        RelayEvent::SocketError(payload) => format!("[error] {payload}"),
        RelayEvent::Closed(close) => format!(
            "[close] code={} reason={}",
            close.code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            close.reason.as_deref().unwrap_or("-")
        ),
    }
}

fn arg_text(arg: &ArgValue) -> String {
    match arg {
        ArgValue::Bool(b) => b.to_string(),
        ArgValue::Number(n) => n.to_string(),
        ArgValue::Structured(value) => value.to_string(),
        ArgValue::Text(text) => text.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_patch::FeedEvent;

    #[test]
    fn feed_events_render_both_ways() {
        let event = RelayEvent::Feed(FeedEvent {
            timestamp: Some(1.0),
            method: "onRoomMsg".into(),
            callback: None,
            args: vec![ArgValue::Text("alice".into()), ArgValue::Number(25.0)],
        });
        assert_eq!(render_event(&event, OutputFormat::Human), "[onRoomMsg] alice | 25");

        let json: serde_json::Value =
            serde_json::from_str(&render_event(&event, OutputFormat::Json)).expect("json");
        assert_eq!(json["event"], "feed");
        assert_eq!(json["data"]["method"], "onRoomMsg");
        assert_eq!(json["data"]["args"], json!(["alice", 25.0]));
    }

    #[test]
    fn unit_variants_serialize_with_tag_only() {
        let json: serde_json::Value =
            serde_json::from_str(&render_event(&RelayEvent::Opened, OutputFormat::Json)).expect("json");
        assert_eq!(json, json!({ "event": "opened" }));
    }
}
