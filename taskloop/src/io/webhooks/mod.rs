//! Webhook subscriptions and background event delivery.

pub mod dispatcher;
pub mod store;

pub use dispatcher::{
    DeliveryRecord, DeliveryRequest, Dispatcher, EventSink, NullSink, ReqwestTransport,
    WebhookTransport, send_test,
};
pub use store::{NewWebhook, WebhookError, WebhookStore, WebhookSubscription, WebhookUpdate};
