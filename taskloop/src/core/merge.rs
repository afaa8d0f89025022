//! Mailbox message model and the change-request merge.
//!
//! Message content is opaque: it is copied verbatim into the merged document
//! and never parsed.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sender recorded when a message names none; never attributed in merges.
pub const ANONYMOUS: &str = "anonymous";

/// Message priority. Serialized as its numeric level (0..=3).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn level(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Accepts a level (`0`..`3`) or a name (`low`, `normal`, `high`, `urgent`).
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Ok(level) = raw.parse::<u8>() {
            return Priority::try_from(level).map_err(anyhow::Error::msg);
        }
        match raw.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => bail!("invalid priority '{other}' (expected low|normal|high|urgent or 0-3)"),
        }
    }

    fn label(self) -> Option<&'static str> {
        match self {
            Priority::Low => Some("[LOW]"),
            Priority::Normal => None,
            Priority::High => Some("[HIGH]"),
            Priority::Urgent => Some("[URGENT]"),
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(level: u8) -> std::result::Result<Self, Self::Error> {
        match level {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Urgent),
            other => Err(format!("priority level {other} out of range 0-3")),
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.level()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending change request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Sort by priority descending, then arrival ascending. Stable, so equal
/// timestamps keep submission order.
pub fn sort_for_merge(messages: &mut [MailboxMessage]) {
    messages.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
}

/// Render a batch into one change-request document for the plan updater.
pub fn merge_messages(
    messages: &[MailboxMessage],
    processed_at: DateTime<Utc>,
) -> Result<String> {
    if messages.is_empty() {
        bail!("cannot merge an empty message batch");
    }
    if let [only] = messages {
        return Ok(merge_single(only));
    }

    let mut sorted = messages.to_vec();
    sort_for_merge(&mut sorted);
    let count = sorted.len();
    let highest = sorted[0].priority;

    let mut out = format!(
        "**Consolidated Change Requests ({count} messages)**\n*Processed at: {}*\n",
        processed_at.to_rfc3339()
    );
    for (i, message) in sorted.iter().enumerate() {
        if i > 0 {
            out.push_str("\n---\n");
        }
        out.push_str(&format!("\n### Request {}", i + 1));
        if let Some(label) = message.priority.label() {
            out.push(' ');
            out.push_str(label);
        }
        if message.sender != ANONYMOUS {
            out.push_str(&format!(" (from {})", message.sender));
        }
        out.push_str("\n\n");
        out.push_str(&message.content);
        out.push('\n');
    }
    out.push_str(&format!(
        "\n**Please address ALL {count} change requests above in the plan update.**\n\
         Highest priority present: {}.\n\
         Prioritize URGENT requests first, then HIGH, then others.\n\
         If requests conflict, prefer higher-priority requests.",
        highest.as_str().to_uppercase()
    ));
    Ok(out)
}

fn merge_single(message: &MailboxMessage) -> String {
    if message.sender == ANONYMOUS {
        return message.content.clone();
    }
    format!("{}\n\n---\n*From: {}*", message.content, message.sender)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(id: &str, sender: &str, priority: Priority, second: u32) -> MailboxMessage {
        MailboxMessage {
            id: id.to_string(),
            sender: sender.to_string(),
            content: format!("content {id}"),
            priority,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, second).unwrap(),
            metadata: BTreeMap::new(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap()
    }

    #[test]
    fn orders_by_priority_then_arrival() {
        let batch = vec![
            message("n", "dev", Priority::Normal, 1),
            message("u", "sec", Priority::Urgent, 2),
            message("l", "docs", Priority::Low, 3),
        ];
        let merged = merge_messages(&batch, now()).expect("merge");
        let n = merged.find("content n").expect("n");
        let u = merged.find("content u").expect("u");
        let l = merged.find("content l").expect("l");
        assert!(u < n && n < l, "{merged}");
        assert!(merged.contains("### Request 1 [URGENT] (from sec)"));
        assert!(merged.contains("### Request 3 [LOW] (from docs)"));
        assert!(merged.contains("Consolidated Change Requests (3 messages)"));
        assert!(merged.contains("Highest priority present: URGENT."));
    }

    #[test]
    fn equal_priority_keeps_arrival_order() {
        let mut batch = vec![
            message("second", "a", Priority::High, 5),
            message("first", "b", Priority::High, 1),
        ];
        sort_for_merge(&mut batch);
        assert_eq!(batch[0].id, "first");
    }

    #[test]
    fn single_message_is_forwarded_verbatim() {
        let mut only = message("x", "anonymous", Priority::Normal, 0);
        only.content = "Message\nwith\ttabs and `[quick]` tags".to_string();
        let merged = merge_messages(std::slice::from_ref(&only), now()).expect("merge");
        assert_eq!(merged, only.content);

        only.sender = "reviewer".to_string();
        let merged = merge_messages(&[only], now()).expect("merge");
        assert!(merged.ends_with("*From: reviewer*"));
    }

    #[test]
    fn anonymous_requests_carry_no_attribution() {
        let batch = vec![
            message("a", ANONYMOUS, Priority::High, 1),
            message("b", "ops", Priority::Normal, 2),
        ];
        let merged = merge_messages(&batch, now()).expect("merge");
        assert!(merged.contains("### Request 1 [HIGH]\n\ncontent a"), "{merged}");
        assert!(merged.contains("### Request 2 (from ops)"));
        assert!(!merged.contains("(from anonymous)"));
    }

    #[test]
    fn empty_batch_is_an_error() {
        assert!(merge_messages(&[], now()).is_err());
    }

    #[test]
    fn priority_accepts_names_and_levels() {
        assert_eq!(Priority::parse("3").expect("level"), Priority::Urgent);
        assert_eq!(Priority::parse("High").expect("name"), Priority::High);
        assert!(Priority::parse("7").is_err());
        let json = serde_json::to_string(&Priority::High).expect("json");
        assert_eq!(json, "2");
    }
}
