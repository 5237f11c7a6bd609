//! K. Notifier (spec.md §2, §7) — opaque sink for critical events:
//! permanent failures, payment-pending exceeding its horizon, retry-cap
//! exhaustion, and loop quarantine.

use async_trait::async_trait;
use log::{error, warn};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub severity: Severity,
    pub email: Option<String>,
    pub message: String,
}

impl NotificationEvent {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            email: None,
            message: message.into(),
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            email: None,
            message: message.into(),
        }
    }

    pub fn for_row(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotificationEvent);
}

/// Logs the event at a level matching its severity. The simplest possible
/// sink, and the one the worker falls back to when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotificationEvent) {
        let subject = event.email.as_deref().unwrap_or("-");
        match event.severity {
            Severity::Warning => warn!("notify[{subject}]: {}", event.message),
            Severity::Critical => error!("notify[{subject}]: {}", event.message),
        }
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    severity: Severity,
    email: Option<&'a str>,
    message: &'a str,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: NotificationEvent) {
        let payload = WebhookPayload {
            severity: event.severity,
            email: event.email.as_deref(),
            message: &event.message,
        };
        if let Err(err) = self.client.post(&self.url).json(&payload).send().await {
            warn!("notify: webhook delivery failed, falling back to log: {err}");
            LogNotifier.notify(event).await;
        }
    }
}

/// Records every event it receives, for assertions in tests elsewhere in
/// the workspace.
#[derive(Default)]
pub struct RecordingNotifier {
    events: std::sync::Mutex<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: NotificationEvent) {
        self.events.lock().unwrap().push(event);
    }
}
