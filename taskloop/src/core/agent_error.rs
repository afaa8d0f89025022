//! Agent failure taxonomy.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Whole-word credential failures; "author" or "oauth2" alone do not count.
static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(credentials?|unauthori[sz]ed|authentication|forbidden|401|403)\b")
        .expect("credential regex")
});

/// Why an agent invocation did not produce a usable result.
///
/// `Timeout` and `Transient` are retried locally; `Credential` and `Fatal`
/// fail the run without retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("agent timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("transient agent failure: {0}")]
    Transient(String),
    #[error("agent credential failure: {0}")]
    Credential(String),
    #[error("fatal agent failure: {0}")]
    Fatal(String),
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Timeout { .. } | AgentError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Timeout { .. } => "timeout",
            AgentError::Transient(_) => "transient",
            AgentError::Credential(_) => "credential",
            AgentError::Fatal(_) => "fatal",
        }
    }
}

/// Classify a failed agent call from its error text (usually stderr).
pub fn classify_failure(message: &str) -> AgentError {
    let lower = message.to_lowercase();
    let detail = message.trim().to_string();

    if lower.contains("content filtering") || lower.contains("output blocked") {
        return AgentError::Fatal(detail);
    }
    if lower.contains("rate") && lower.contains("limit") {
        return AgentError::Transient(detail);
    }
    if CREDENTIAL_RE.is_match(&lower) {
        return AgentError::Credential(detail);
    }
    AgentError::Transient(detail)
}
