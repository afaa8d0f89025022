//! Webhook subscriptions persisted in `webhooks.json`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::core::events::EventType;
use crate::io::config::WebhookDefaults;
use crate::io::fs::{FileLockGuard, read_json, write_json};
use crate::io::state_store::StatePaths;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebhookError {
    #[error("webhook {0} not found")]
    NotFound(String),
    #[error("a webhook for {0} already exists")]
    Duplicate(String),
    #[error("invalid webhook: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Empty = every event.
    #[serde(default)]
    pub events: Vec<EventType>,
    pub enabled: bool,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub verify_tls: bool,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn accepts(&self, event_type: EventType) -> bool {
        self.enabled && (self.events.is_empty() || self.events.contains(&event_type))
    }

    /// Listing view; never exposes the secret.
    pub fn view(&self) -> WebhookView {
        WebhookView {
            id: self.id.clone(),
            url: self.url.clone(),
            has_secret: self.secret.is_some(),
            events: self.events.clone(),
            enabled: self.enabled,
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries,
            verify_tls: self.verify_tls,
            headers: self.headers.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookView {
    pub id: String,
    pub url: String,
    pub has_secret: bool,
    pub events: Vec<EventType>,
    pub enabled: bool,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub verify_tls: bool,
    pub headers: BTreeMap<String, String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for `webhooks.create`.
#[derive(Debug, Clone, Default)]
pub struct NewWebhook {
    pub url: String,
    pub secret: Option<String>,
    /// Event type names; validated on create.
    pub events: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub verify_tls: Option<bool>,
    pub headers: BTreeMap<String, String>,
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Partial update for `webhooks.update`.
#[derive(Debug, Clone, Default)]
pub struct WebhookUpdate {
    pub url: Option<String>,
    /// `Some("")` removes the secret.
    pub secret: Option<String>,
    pub events: Option<Vec<String>>,
    pub enabled: Option<bool>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub verify_tls: Option<bool>,
    pub headers: Option<BTreeMap<String, String>>,
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct WebhooksFile {
    subscriptions: Vec<WebhookSubscription>,
}

#[derive(Debug, Clone)]
pub struct WebhookStore {
    path: PathBuf,
    lock_path: PathBuf,
    defaults: WebhookDefaults,
}

impl WebhookStore {
    pub fn new(paths: &StatePaths, defaults: WebhookDefaults) -> Self {
        Self {
            path: paths.webhooks(),
            lock_path: paths.root().join("webhooks.lock"),
            defaults,
        }
    }

    pub fn create(&self, input: NewWebhook) -> Result<WebhookSubscription> {
        let url = validate_url(&input.url)?;
        let events = parse_events(&input.events)?;
        let timeout_secs = input.timeout_secs.unwrap_or(self.defaults.default_timeout_secs);
        if timeout_secs == 0 {
            return Err(WebhookError::Invalid("timeout must be > 0".into()).into());
        }

        let _guard = FileLockGuard::acquire(&self.lock_path)?;
        let mut file = self.read()?;
        if file.subscriptions.iter().any(|s| s.url == url) {
            return Err(WebhookError::Duplicate(url).into());
        }
        let now = Utc::now();
        let subscription = WebhookSubscription {
            id: new_webhook_id(),
            url,
            secret: input.secret.filter(|s| !s.is_empty()),
            events,
            enabled: true,
            timeout_secs,
            max_retries: input.max_retries.unwrap_or(self.defaults.default_max_retries),
            verify_tls: input.verify_tls.unwrap_or(true),
            headers: input.headers,
            name: input.name,
            description: input.description,
            created_at: now,
            updated_at: now,
        };
        file.subscriptions.push(subscription.clone());
        write_json(&self.path, &file)?;
        info!(id = %subscription.id, url = %subscription.url, "webhook created");
        Ok(subscription)
    }

    pub fn list(&self) -> Result<Vec<WebhookSubscription>> {
        Ok(self.read()?.subscriptions)
    }

    pub fn get(&self, id: &str) -> Result<WebhookSubscription> {
        self.read()?
            .subscriptions
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| WebhookError::NotFound(id.to_string()).into())
    }

    pub fn update(&self, id: &str, update: WebhookUpdate) -> Result<WebhookSubscription> {
        let _guard = FileLockGuard::acquire(&self.lock_path)?;
        let mut file = self.read()?;
        let Some(pos) = file.subscriptions.iter().position(|s| s.id == id) else {
            return Err(WebhookError::NotFound(id.to_string()).into());
        };

        let mut next = file.subscriptions[pos].clone();
        if let Some(url) = update.url {
            let url = validate_url(&url)?;
            if file.subscriptions.iter().any(|s| s.id != id && s.url == url) {
                return Err(WebhookError::Duplicate(url).into());
            }
            next.url = url;
        }
        if let Some(secret) = update.secret {
            next.secret = (!secret.is_empty()).then_some(secret);
        }
        if let Some(events) = update.events {
            next.events = parse_events(&events)?;
        }
        if let Some(enabled) = update.enabled {
            next.enabled = enabled;
        }
        if let Some(timeout) = update.timeout_secs {
            if timeout == 0 {
                return Err(WebhookError::Invalid("timeout must be > 0".into()).into());
            }
            next.timeout_secs = timeout;
        }
        if let Some(retries) = update.max_retries {
            next.max_retries = retries;
        }
        if let Some(verify) = update.verify_tls {
            next.verify_tls = verify;
        }
        if let Some(headers) = update.headers {
            next.headers = headers;
        }
        if let Some(name) = update.name {
            next.name = Some(name);
        }
        if let Some(description) = update.description {
            next.description = Some(description);
        }
        next.updated_at = Utc::now();

        file.subscriptions[pos] = next.clone();
        write_json(&self.path, &file)?;
        info!(id, "webhook updated");
        Ok(next)
    }

    pub fn delete(&self, id: &str) -> Result<WebhookSubscription> {
        let _guard = FileLockGuard::acquire(&self.lock_path)?;
        let mut file = self.read()?;
        let Some(pos) = file.subscriptions.iter().position(|s| s.id == id) else {
            return Err(WebhookError::NotFound(id.to_string()).into());
        };
        let removed = file.subscriptions.remove(pos);
        write_json(&self.path, &file)?;
        info!(id, "webhook deleted");
        Ok(removed)
    }

    fn read(&self) -> Result<WebhooksFile> {
        if !self.path.exists() {
            return Ok(WebhooksFile::default());
        }
        read_json(&self.path)
    }
}

fn new_webhook_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("wh_{}_{}", &hex[..8], &hex[8..16])
}

fn validate_url(raw: &str) -> Result<String> {
    let url = raw.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(url.to_string()),
        _ => Err(WebhookError::Invalid(format!("url must be http(s)://host..., got '{raw}'")).into()),
    }
}

fn parse_events(raw: &[String]) -> Result<Vec<EventType>> {
    let mut events = Vec::new();
    for name in raw {
        let event: EventType = name.parse().map_err(WebhookError::Invalid)?;
        if !events.contains(&event) {
            events.push(event);
        }
    }
    Ok(events)
}
