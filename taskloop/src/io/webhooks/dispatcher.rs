//! Background, at-least-once delivery of lifecycle events.
//!
//! Each subscription gets its own worker thread and queue, so a slow or failing
//! endpoint only delays its own deliveries. Nothing here touches run state and
//! delivery failures are logged, never returned to the orchestrator.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::budget::backoff_delay;
use crate::core::events::{EventType, WebhookEvent};
use crate::core::signature::{sign, sign_timestamped};
use crate::io::config::WebhookDefaults;
use crate::io::webhooks::store::{WebhookStore, WebhookSubscription};

/// Receiver of lifecycle events. `emit` must not block on delivery.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WebhookEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, event: WebhookEvent) {
        debug!(event_type = %event.event_type, "event dropped (no sink)");
    }
}

/// One HTTP POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub url: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub verify_tls: bool,
}

impl DeliveryRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP seam. Returns the response status code; transport failures
/// (timeouts, refused connections) are errors.
pub trait WebhookTransport: Send + Sync {
    fn post(&self, request: &DeliveryRequest) -> Result<u16>;
}

/// Blocking `reqwest` transport.
pub struct ReqwestTransport {
    verified: reqwest::blocking::Client,
    unverified: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let user_agent = concat!("taskloop/", env!("CARGO_PKG_VERSION"));
        let verified = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .build()
            .context("build http client")?;
        let unverified = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .danger_accept_invalid_certs(true)
            .build()
            .context("build http client (tls verification disabled)")?;
        Ok(Self {
            verified,
            unverified,
        })
    }
}

impl WebhookTransport for ReqwestTransport {
    fn post(&self, request: &DeliveryRequest) -> Result<u16> {
        let client = if request.verify_tls {
            &self.verified
        } else {
            &self.unverified
        };
        let mut builder = client
            .post(&request.url)
            .timeout(request.timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let response = builder
            .send()
            .with_context(|| format!("post {}", request.url))?;
        Ok(response.status().as_u16())
    }
}

/// Build the signed POST for `event` to `subscription`.
pub fn build_request(
    subscription: &WebhookSubscription,
    event: &WebhookEvent,
    delivery_id: &str,
) -> Result<DeliveryRequest> {
    let body = event.payload().context("serialize webhook payload")?;
    let timestamp = event.timestamp.timestamp();
    let mut headers: Vec<(String, String)> = vec![
        ("Content-Type".into(), "application/json".into()),
        ("X-Webhook-Event".into(), event.event_type.as_str().into()),
        ("X-Webhook-Delivery-Id".into(), delivery_id.into()),
        ("X-Webhook-Timestamp".into(), timestamp.to_string()),
    ];
    if let Some(secret) = &subscription.secret {
        headers.push(("X-Webhook-Signature".into(), sign(&body, secret)?));
        headers.push((
            "X-Webhook-Signature-256".into(),
            sign_timestamped(&body, secret, timestamp)?,
        ));
    }
    for (name, value) in &subscription.headers {
        headers.push((name.clone(), value.clone()));
    }
    Ok(DeliveryRequest {
        url: subscription.url.clone(),
        body,
        headers,
        timeout: Duration::from_secs(subscription.timeout_secs),
        verify_tls: subscription.verify_tls,
    })
}

/// Outcome line appended to `webhook_deliveries.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryRecord {
    pub delivery_id: String,
    pub subscription_id: String,
    pub event_id: String,
    pub event_type: EventType,
    pub url: String,
    pub attempts: u32,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    base: Duration,
    max: Duration,
}

impl From<&WebhookDefaults> for RetryPolicy {
    fn from(defaults: &WebhookDefaults) -> Self {
        Self {
            base: Duration::from_millis(defaults.backoff_base_ms),
            max: Duration::from_millis(defaults.backoff_max_ms),
        }
    }
}

/// Deliver one event with retries. Blocks the calling thread.
fn deliver(
    transport: &dyn WebhookTransport,
    subscription: &WebhookSubscription,
    event: &WebhookEvent,
    policy: RetryPolicy,
) -> DeliveryRecord {
    let delivery_id = Uuid::new_v4().to_string();
    let mut record = DeliveryRecord {
        delivery_id: delivery_id.clone(),
        subscription_id: subscription.id.clone(),
        event_id: event.event_id.clone(),
        event_type: event.event_type,
        url: subscription.url.clone(),
        attempts: 0,
        success: false,
        status_code: None,
        error: None,
        finished_at: Utc::now(),
    };
    let request = match build_request(subscription, event, &delivery_id) {
        Ok(request) => request,
        Err(err) => {
            record.error = Some(format!("{err:#}"));
            return record;
        }
    };

    let total_attempts = subscription.max_retries + 1;
    for attempt in 1..=total_attempts {
        if attempt > 1 {
            thread::sleep(backoff_delay(attempt - 1, policy.base, policy.max));
        }
        record.attempts = attempt;
        match transport.post(&request) {
            Ok(code) if (200..300).contains(&code) => {
                record.status_code = Some(code);
                record.success = true;
                record.error = None;
                break;
            }
            Ok(code) => {
                record.status_code = Some(code);
                record.error = Some(format!("non-2xx response {code}"));
            }
            Err(err) => {
                record.status_code = None;
                record.error = Some(format!("{err:#}"));
            }
        }
        debug!(
            subscription = %subscription.id,
            attempt,
            error = ?record.error,
            "webhook attempt failed"
        );
    }
    record.finished_at = Utc::now();
    record
}

/// Synchronous `webhook.test` ping.
pub fn send_test(
    transport: &dyn WebhookTransport,
    subscription: &WebhookSubscription,
    run_id: &str,
) -> DeliveryRecord {
    let event = WebhookEvent::new(
        EventType::WebhookTest,
        run_id,
        serde_json::json!({ "message": "webhook test", "webhook_id": subscription.id }),
    );
    let once = WebhookSubscription {
        max_retries: 0,
        ..subscription.clone()
    };
    deliver(transport, &once, &event, RetryPolicy {
        base: Duration::ZERO,
        max: Duration::ZERO,
    })
}

struct DeliveryJob {
    subscription: WebhookSubscription,
    event: WebhookEvent,
}

struct Worker {
    tx: Sender<DeliveryJob>,
    handle: JoinHandle<()>,
}

/// Append-only outcome log shared by the workers.
struct DeliveryLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DeliveryLog {
    fn append(&self, record: &DeliveryRecord) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("delivery log lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        let mut line = serde_json::to_string(record).context("serialize delivery record")?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }
}

/// Fans events out to per-subscription worker queues.
pub struct Dispatcher {
    store: WebhookStore,
    transport: Arc<dyn WebhookTransport>,
    log: Arc<DeliveryLog>,
    policy: RetryPolicy,
    workers: Mutex<HashMap<String, Worker>>,
}

impl Dispatcher {
    pub fn new(
        store: WebhookStore,
        transport: Arc<dyn WebhookTransport>,
        deliveries_path: PathBuf,
        defaults: &WebhookDefaults,
    ) -> Self {
        Self {
            store,
            transport,
            log: Arc::new(DeliveryLog {
                path: deliveries_path,
                lock: Mutex::new(()),
            }),
            policy: RetryPolicy::from(defaults),
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn spawn_worker(&self, subscription_id: &str) -> Worker {
        let (tx, rx) = mpsc::channel::<DeliveryJob>();
        let transport = Arc::clone(&self.transport);
        let log = Arc::clone(&self.log);
        let policy = self.policy;
        let id = subscription_id.to_string();
        let handle = thread::spawn(move || {
            for job in rx {
                let record = deliver(transport.as_ref(), &job.subscription, &job.event, policy);
                if record.success {
                    debug!(subscription = %id, event = %record.event_type, attempts = record.attempts, "webhook delivered");
                } else {
                    warn!(
                        subscription = %id,
                        event = %record.event_type,
                        attempts = record.attempts,
                        error = ?record.error,
                        "webhook delivery exhausted retries"
                    );
                }
                if let Err(err) = log.append(&record) {
                    warn!(err = %err, "failed to record webhook delivery");
                }
            }
        });
        Worker { tx, handle }
    }

    /// Stop accepting events and wait up to `timeout` for queued deliveries.
    /// Workers still busy after the deadline are left to finish detached.
    #[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64))]
    pub fn shutdown(&self, timeout: Duration) {
        let workers: Vec<Worker> = match self.workers.lock() {
            Ok(mut map) => map.drain().map(|(_, w)| w).collect(),
            Err(_) => {
                warn!("dispatcher worker map poisoned");
                return;
            }
        };
        let mut handles = Vec::new();
        for worker in workers {
            drop(worker.tx);
            handles.push(worker.handle);
        }
        let deadline = Instant::now() + timeout;
        while handles.iter().any(|h| !h.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let mut pending = 0usize;
        for handle in handles {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                pending += 1;
            }
        }
        if pending > 0 {
            warn!(pending, "webhook workers still delivering at shutdown");
        } else {
            info!("webhook dispatcher drained");
        }
    }
}

impl EventSink for Dispatcher {
    fn emit(&self, event: WebhookEvent) {
        let subscriptions = match self.store.list() {
            Ok(subs) => subs,
            Err(err) => {
                warn!(err = %err, "cannot read webhook subscriptions");
                return;
            }
        };
        let Ok(mut workers) = self.workers.lock() else {
            warn!("dispatcher worker map poisoned");
            return;
        };
        for subscription in subscriptions
            .into_iter()
            .filter(|s| s.accepts(event.event_type))
        {
            let worker = workers
                .entry(subscription.id.clone())
                .or_insert_with(|| self.spawn_worker(&subscription.id));
            let id = subscription.id.clone();
            let job = DeliveryJob {
                subscription,
                event: event.clone(),
            };
            if worker.tx.send(job).is_err() {
                warn!(subscription = %id, "webhook worker gone; event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signature::{verify, verify_timestamped};
    use std::collections::BTreeMap;

    fn subscription(secret: Option<&str>) -> WebhookSubscription {
        WebhookSubscription {
            id: "wh_00000000_00000000".into(),
            url: "https://hooks.test/a".into(),
            secret: secret.map(str::to_string),
            events: Vec::new(),
            enabled: true,
            timeout_secs: 5,
            max_retries: 2,
            verify_tls: true,
            headers: BTreeMap::from([("X-Team".to_string(), "infra".to_string())]),
            name: None,
            description: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct Flaky {
        codes: Mutex<Vec<u16>>,
    }

    impl WebhookTransport for Flaky {
        fn post(&self, _request: &DeliveryRequest) -> Result<u16> {
            let mut codes = self.codes.lock().expect("lock");
            if codes.is_empty() {
                return Err(anyhow!("connection refused"));
            }
            Ok(codes.remove(0))
        }
    }

    fn no_wait() -> RetryPolicy {
        RetryPolicy {
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    #[test]
    fn signed_request_carries_both_signatures() {
        let sub = subscription(Some("topsecret"));
        let event = WebhookEvent::new(EventType::PrCreated, "run-1", serde_json::json!({"pr": 4}));
        let request = build_request(&sub, &event, "d-1").expect("request");

        let sig = request.header("X-Webhook-Signature").expect("sig");
        let sig256 = request.header("X-Webhook-Signature-256").expect("sig256");
        let ts: i64 = request
            .header("X-Webhook-Timestamp")
            .expect("ts")
            .parse()
            .expect("int");
        assert!(verify(&request.body, "topsecret", sig));
        assert!(verify_timestamped(&request.body, "topsecret", ts, sig256));
        assert_eq!(request.header("X-Webhook-Event"), Some("pr.created"));
        assert_eq!(request.header("X-Webhook-Delivery-Id"), Some("d-1"));
        assert_eq!(request.header("x-team"), Some("infra"));
    }

    #[test]
    fn unsigned_request_has_no_signature_headers() {
        let event = WebhookEvent::new(EventType::RunStarted, "run-1", serde_json::Value::Null);
        let request = build_request(&subscription(None), &event, "d").expect("request");
        assert!(request.header("X-Webhook-Signature").is_none());
    }

    #[test]
    fn retries_until_success() {
        let transport = Flaky {
            codes: Mutex::new(vec![500, 503, 204]),
        };
        let event = WebhookEvent::new(EventType::RunStarted, "run-1", serde_json::Value::Null);
        let record = deliver(&transport, &subscription(None), &event, no_wait());
        assert!(record.success);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.status_code, Some(204));
    }

    #[test]
    fn gives_up_after_max_retries() {
        let transport = Flaky {
            codes: Mutex::new(vec![500]),
        };
        let event = WebhookEvent::new(EventType::RunStarted, "run-1", serde_json::Value::Null);
        let record = deliver(&transport, &subscription(None), &event, no_wait());
        assert!(!record.success);
        assert_eq!(record.attempts, 3);
        assert!(record.error.as_deref().is_some_and(|e| e.contains("connection refused")));
    }
}
