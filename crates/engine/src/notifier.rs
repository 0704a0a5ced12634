//! Notification channel seam
//!
//! The engine only decides *what* to announce. Rendering and delivery belong
//! to a [`Notifier`]: [`LogNotifier`] writes to the log, [`WebhookNotifier`]
//! forwards each notification as JSON to an HTTP endpoint.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Opaque handle of a delivered notification, used for threading and retraction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationRef(String);

impl NotificationRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotificationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the engine can announce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// Early warning one round before a full trigger
    PreSignal { consecutive: usize, remaining: usize },
    /// Confirmed entry
    Signal {
        last_multiplier: Decimal,
        target: Decimal,
    },
    Gale {
        depth: u8,
        result: Decimal,
        target: Decimal,
    },
    Win {
        result: Decimal,
        target: Decimal,
        wins: u32,
        losses: u32,
    },
    Recovery {
        depth: u8,
        result: Decimal,
        target: Decimal,
        wins: u32,
        losses: u32,
    },
    Loss {
        result: Decimal,
        wins: u32,
        losses: u32,
    },
    /// The run announced by a pre-signal broke before confirming
    Cancelled,
    StreakMilestone { streak: u32 },
    KeepAlive { variant: u8 },
    CooldownEntered { minutes: u32 },
    CooldownMidpoint { minutes_left: u32 },
    PatternMonitoring { count: usize, remaining: usize },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::PreSignal { .. } => "pre_signal",
            Notification::Signal { .. } => "signal",
            Notification::Gale { .. } => "gale",
            Notification::Win { .. } => "win",
            Notification::Recovery { .. } => "recovery",
            Notification::Loss { .. } => "loss",
            Notification::Cancelled => "cancelled",
            Notification::StreakMilestone { .. } => "streak_milestone",
            Notification::KeepAlive { .. } => "keep_alive",
            Notification::CooldownEntered { .. } => "cooldown_entered",
            Notification::CooldownMidpoint { .. } => "cooldown_midpoint",
            Notification::PatternMonitoring { .. } => "pattern_monitoring",
        }
    }
}

/// Delivery side of the engine. Failures are reported but never retried by the engine.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `notification`, optionally threaded onto an earlier one
    async fn emit(
        &self,
        notification: &Notification,
        reply_to: Option<&NotificationRef>,
    ) -> Result<NotificationRef>;

    /// Retract a delivered notification
    async fn delete(&self, reference: &NotificationRef) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Log notifier
// ---------------------------------------------------------------------------

/// Writes notifications to the log. Used when no channel is configured.
#[derive(Debug, Default)]
pub struct LogNotifier {
    next: AtomicU64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn emit(
        &self,
        notification: &Notification,
        reply_to: Option<&NotificationRef>,
    ) -> Result<NotificationRef> {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let reference = NotificationRef::new(format!("log-{id}"));
        info!(
            kind = notification.kind(),
            reference = %reference,
            reply_to = reply_to.map(NotificationRef::as_str),
            payload = %serde_json::to_string(notification)?,
            "Notification"
        );
        Ok(reference)
    }

    async fn delete(&self, reference: &NotificationRef) -> Result<()> {
        info!(reference = %reference, "Notification retracted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Webhook notifier
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct EmitRequest<'a> {
    notification: &'a Notification,
    reply_to: Option<&'a NotificationRef>,
}

#[derive(Debug, Deserialize)]
struct EmitResponse {
    reference: NotificationRef,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    reference: &'a NotificationRef,
}

/// Posts notifications to `{url}` and retractions to `{url}/delete`.
/// The endpoint answers an emit with `{"reference": "..."}`.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn emit(
        &self,
        notification: &Notification,
        reply_to: Option<&NotificationRef>,
    ) -> Result<NotificationRef> {
        debug!(kind = notification.kind(), "Posting notification");
        let resp = self
            .client
            .post(&self.url)
            .json(&EmitRequest {
                notification,
                reply_to,
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Notification webhook error {}: {}", status, body);
        }

        let body: EmitResponse = resp.json().await?;
        Ok(body.reference)
    }

    async fn delete(&self, reference: &NotificationRef) -> Result<()> {
        let url = format!("{}/delete", self.url);
        let resp = self
            .client
            .post(&url)
            .json(&DeleteRequest { reference })
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Notification delete error {}: {}", status, body);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_notification_wire_shape() {
        let json = serde_json::to_value(Notification::Gale {
            depth: 1,
            result: dec!(1.5),
            target: dec!(1.8),
        })
        .unwrap();
        assert_eq!(json["kind"], "gale");
        assert_eq!(json["depth"], 1);

        let cancelled = serde_json::to_value(Notification::Cancelled).unwrap();
        assert_eq!(cancelled, serde_json::json!({"kind": "cancelled"}));
    }

    #[tokio::test]
    async fn test_log_notifier_issues_distinct_refs() {
        let notifier = LogNotifier::new();
        let a = notifier.emit(&Notification::Cancelled, None).await.unwrap();
        let b = notifier
            .emit(&Notification::KeepAlive { variant: 0 }, Some(&a))
            .await
            .unwrap();
        assert_ne!(a, b);
        notifier.delete(&a).await.unwrap();
    }

    #[test]
    fn test_webhook_url_normalized() {
        let notifier = WebhookNotifier::new("http://localhost:9000/hook/").unwrap();
        assert_eq!(notifier.url, "http://localhost:9000/hook");
    }
}
