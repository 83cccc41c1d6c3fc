//! Click actions derived from a recording segment's breadcrumbs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// rrweb custom event type carrying breadcrumbs.
const RRWEB_CUSTOM_EVENT: i64 = 5;

pub const DEAD_CLICK_THRESHOLD_MS: f64 = 7000.0;
pub const RAGE_CLICK_MIN_COUNT: i64 = 5;

const MAX_TEXT_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayClick {
    pub node_id: i64,
    pub tag: String,
    pub id: String,
    pub classes: Vec<String>,
    pub text: String,
    pub role: String,
    pub alt: String,
    pub testid: String,
    pub aria_label: String,
    pub title: String,
    pub component_name: String,
    pub timestamp: f64,
    pub is_dead: bool,
    pub is_rage: bool,
}

/// Fan-out payload for the replay actions topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayActionsEvent {
    pub replay_id: String,
    pub project_id: i64,
    pub segment_id: u32,
    pub retention_days: i64,
    pub clicks: Vec<ReplayClick>,
}

impl ReplayActionsEvent {
    pub fn dead_click_count(&self) -> usize {
        self.clicks.iter().filter(|c| c.is_dead).count()
    }

    pub fn rage_click_count(&self) -> usize {
        self.clicks.iter().filter(|c| c.is_rage).count()
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&serde_json::json!({
            "type": "replay_actions",
            "replay_id": self.replay_id,
            "project_id": self.project_id,
            "segment_id": self.segment_id,
            "retention_days": self.retention_days,
            "clicks": self.clicks,
        }))
    }
}

/// Extract click actions from a decoded rrweb event list. Events that are not
/// click breadcrumbs, or that lack a target node, are skipped.
pub fn parse_replay_actions(
    replay_id: &str,
    project_id: i64,
    segment_id: u32,
    retention_days: i64,
    events: &[Value],
) -> Option<ReplayActionsEvent> {
    let clicks: Vec<ReplayClick> = events.iter().filter_map(parse_click).collect();
    if clicks.is_empty() {
        return None;
    }

    Some(ReplayActionsEvent {
        replay_id: replay_id.to_string(),
        project_id,
        segment_id,
        retention_days,
        clicks,
    })
}

fn parse_click(event: &Value) -> Option<ReplayClick> {
    if event.get("type")?.as_i64()? != RRWEB_CUSTOM_EVENT {
        return None;
    }
    let data = event.get("data")?;
    if data.get("tag")?.as_str()? != "breadcrumb" {
        return None;
    }
    let payload = data.get("payload")?;
    let category = payload.get("category")?.as_str()?;
    let crumb = payload.get("data")?;

    let (is_dead, is_rage) = match category {
        "ui.click" => (false, false),
        "ui.slowClickDetected" => {
            let is_timeout = crumb.get("endReason").and_then(Value::as_str) == Some("timeout");
            let waited = crumb
                .get("timeAfterClickMs")
                .and_then(Value::as_f64)
                .unwrap_or_default();
            if !(is_timeout && waited >= DEAD_CLICK_THRESHOLD_MS) {
                return None;
            }
            (true, click_count(crumb) >= RAGE_CLICK_MIN_COUNT)
        }
        "ui.multiClick" => {
            if click_count(crumb) < RAGE_CLICK_MIN_COUNT {
                return None;
            }
            (false, true)
        }
        _ => return None,
    };

    let node = crumb.get("node")?;
    let tag = node.get("tagName")?.as_str()?.to_lowercase();
    let node_id = node
        .get("id")
        .or_else(|| crumb.get("nodeId"))
        .and_then(Value::as_i64)?;
    let attributes = node.get("attributes");
    let attr = |name: &str| -> String {
        attributes
            .and_then(|a| a.get(name))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let classes = attr("class")
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let text: String = node
        .get("textContent")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .chars()
        .take(MAX_TEXT_LENGTH)
        .collect();
    let timestamp = payload
        .get("timestamp")
        .and_then(Value::as_f64)
        .or_else(|| event.get("timestamp").and_then(Value::as_f64).map(|ms| ms / 1000.0))
        .unwrap_or_default();

    Some(ReplayClick {
        node_id,
        tag,
        id: attr("id"),
        classes,
        text,
        role: attr("role"),
        alt: attr("alt"),
        testid: attr("data-testid"),
        aria_label: attr("aria-label"),
        title: attr("title"),
        component_name: attr("data-sentry-component"),
        timestamp,
        is_dead,
        is_rage,
    })
}

fn click_count(crumb: &Value) -> i64 {
    crumb
        .get("clickCount")
        .and_then(Value::as_i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn breadcrumb(category: &str, data: Value) -> Value {
        json!({
            "type": 5,
            "timestamp": 1_700_000_000_000i64,
            "data": {
                "tag": "breadcrumb",
                "payload": {
                    "category": category,
                    "timestamp": 1_700_000_000.5,
                    "data": data,
                }
            }
        })
    }

    fn node() -> Value {
        json!({
            "id": 7,
            "tagName": "BUTTON",
            "textContent": "Save",
            "attributes": {
                "id": "save",
                "class": "btn  primary",
                "data-testid": "save-button",
                "aria-label": "Save changes",
                "data-sentry-component": "SaveButton",
            }
        })
    }

    #[test]
    fn test_plain_click_is_parsed() {
        let events = vec![breadcrumb("ui.click", json!({ "nodeId": 7, "node": node() }))];

        let actions = parse_replay_actions("abc", 1, 0, 90, &events).unwrap();

        assert_eq!(actions.clicks.len(), 1);
        let click = &actions.clicks[0];
        assert_eq!(click.tag, "button");
        assert_eq!(click.node_id, 7);
        assert_eq!(click.classes, vec!["btn".to_string(), "primary".to_string()]);
        assert_eq!(click.testid, "save-button");
        assert_eq!(click.component_name, "SaveButton");
        assert_eq!(click.timestamp, 1_700_000_000.5);
        assert!(!click.is_dead);
        assert!(!click.is_rage);
    }

    #[test]
    fn test_slow_click_classification() {
        let events = vec![
            breadcrumb(
                "ui.slowClickDetected",
                json!({ "endReason": "timeout", "timeAfterClickMs": 7000, "clickCount": 5, "node": node() }),
            ),
            breadcrumb(
                "ui.slowClickDetected",
                json!({ "endReason": "timeout", "timeAfterClickMs": 7500, "clickCount": 1, "node": node() }),
            ),
            // Below the threshold, not dead
            breadcrumb(
                "ui.slowClickDetected",
                json!({ "endReason": "timeout", "timeAfterClickMs": 3000, "clickCount": 1, "node": node() }),
            ),
            // Ended by a mutation, not dead
            breadcrumb(
                "ui.slowClickDetected",
                json!({ "endReason": "mutation", "timeAfterClickMs": 9000, "clickCount": 1, "node": node() }),
            ),
        ];

        let actions = parse_replay_actions("abc", 1, 0, 90, &events).unwrap();

        assert_eq!(actions.clicks.len(), 2);
        assert_eq!(actions.dead_click_count(), 2);
        assert_eq!(actions.rage_click_count(), 1);
    }

    #[test]
    fn test_multi_click_needs_enough_clicks() {
        let events = vec![
            breadcrumb("ui.multiClick", json!({ "clickCount": 4, "node": node() })),
            breadcrumb("ui.multiClick", json!({ "clickCount": 6, "node": node() })),
        ];

        let actions = parse_replay_actions("abc", 1, 0, 90, &events).unwrap();

        assert_eq!(actions.clicks.len(), 1);
        assert!(actions.clicks[0].is_rage);
        assert!(!actions.clicks[0].is_dead);
    }

    #[test]
    fn test_no_clicks_yields_none() {
        let events = vec![
            json!({ "type": 3, "data": {} }),
            breadcrumb("navigation", json!({ "to": "/home" })),
            breadcrumb("ui.click", json!({ "nodeId": 1 })),
        ];

        assert!(parse_replay_actions("abc", 1, 0, 90, &events).is_none());
    }

    #[test]
    fn test_payload_shape() {
        let events = vec![breadcrumb("ui.click", json!({ "node": node() }))];
        let actions = parse_replay_actions("abc", 1, 2, 30, &events).unwrap();

        let payload: Value = serde_json::from_slice(&actions.to_payload().unwrap()).unwrap();

        assert_eq!(payload["type"], "replay_actions");
        assert_eq!(payload["segment_id"], 2);
        assert_eq!(payload["clicks"][0]["tag"], "button");
    }
}
