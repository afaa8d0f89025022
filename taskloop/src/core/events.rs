//! Lifecycle event model delivered to webhook subscribers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "status.changed")]
    StatusChanged,
    #[serde(rename = "ci.passed")]
    CiPassed,
    #[serde(rename = "ci.failed")]
    CiFailed,
    #[serde(rename = "plan.updated")]
    PlanUpdated,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "pr.created")]
    PrCreated,
    #[serde(rename = "pr.merged")]
    PrMerged,
    #[serde(rename = "session.started")]
    SessionStarted,
    #[serde(rename = "session.completed")]
    SessionCompleted,
    /// Connectivity ping; never emitted by a run.
    #[serde(rename = "webhook.test")]
    WebhookTest,
}

impl EventType {
    pub const ALL: [EventType; 14] = [
        EventType::RunStarted,
        EventType::RunCompleted,
        EventType::StatusChanged,
        EventType::CiPassed,
        EventType::CiFailed,
        EventType::PlanUpdated,
        EventType::TaskStarted,
        EventType::TaskCompleted,
        EventType::TaskFailed,
        EventType::PrCreated,
        EventType::PrMerged,
        EventType::SessionStarted,
        EventType::SessionCompleted,
        EventType::WebhookTest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RunStarted => "run.started",
            EventType::RunCompleted => "run.completed",
            EventType::StatusChanged => "status.changed",
            EventType::CiPassed => "ci.passed",
            EventType::CiFailed => "ci.failed",
            EventType::PlanUpdated => "plan.updated",
            EventType::TaskStarted => "task.started",
            EventType::TaskCompleted => "task.completed",
            EventType::TaskFailed => "task.failed",
            EventType::PrCreated => "pr.created",
            EventType::PrMerged => "pr.merged",
            EventType::SessionStarted => "session.started",
            EventType::SessionCompleted => "session.completed",
            EventType::WebhookTest => "webhook.test",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| format!("unknown event type '{s}'"))
    }
}

/// One event as serialized onto the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl WebhookEvent {
    /// New event with a fresh id. `run_id` is folded into `data`.
    pub fn new(event_type: EventType, run_id: &str, data: Value) -> Self {
        let mut map = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        map.insert("run_id".to_string(), Value::String(run_id.to_string()));
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            data: Value::Object(map),
        }
    }

    pub fn payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_names_round_trip() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>(), Ok(t));
            assert_eq!(serde_json::to_value(t).expect("json"), json!(t.as_str()));
        }
        assert!("run.exploded".parse::<EventType>().is_err());
    }

    #[test]
    fn event_data_carries_run_id() {
        let event = WebhookEvent::new(EventType::TaskStarted, "20250101-120000", json!({"task_index": 0}));
        assert_eq!(event.data["run_id"], "20250101-120000");
        assert_eq!(event.data["task_index"], 0);

        let payload: Value = serde_json::from_slice(&event.payload().expect("payload")).expect("parse");
        assert_eq!(payload["event_type"], "task.started");
        assert!(payload["event_id"].as_str().is_some_and(|id| !id.is_empty()));
    }
}
