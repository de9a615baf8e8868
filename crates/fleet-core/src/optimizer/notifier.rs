//! Notifications fired before optimizer actions

use super::policy::OptimizerAction;
use crate::error::{FleetError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use url::Url;

/// Announcement of an action the optimizer is about to take
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerNotification {
    pub action: OptimizerAction,
    pub instance_id: String,
    pub provider: String,
    pub reason: String,
    pub dry_run: bool,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &OptimizerNotification) -> Result<()>;
}

/// POSTs each notification as JSON
pub struct WebhookNotifier {
    client: Client,
    url: Url,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| FleetError::Config(format!("invalid webhook url {url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FleetError::Config(format!(
                "webhook url must be http or https, got {}",
                url.scheme()
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FleetError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &OptimizerNotification) -> Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .json(notification)
            .send()
            .await
            .map_err(|e| FleetError::Notification(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FleetError::Notification(format!(
                "webhook returned {status}: {body}"
            )));
        }
        Ok(())
    }
}

/// Writes notifications to the log only
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &OptimizerNotification) -> Result<()> {
        info!(
            event = "optimizer_notification",
            action = %notification.action,
            instance_id = %notification.instance_id,
            provider = %notification.provider,
            reason = %notification.reason,
            dry_run = notification.dry_run,
            "Optimizer action pending"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_url_validation() {
        let timeout = Duration::from_secs(5);

        let notifier = WebhookNotifier::new("https://hooks.example.com/fleet", timeout).unwrap();
        assert_eq!(notifier.url().host_str(), Some("hooks.example.com"));

        assert!(matches!(
            WebhookNotifier::new("not a url", timeout),
            Err(FleetError::Config(_))
        ));
        assert!(matches!(
            WebhookNotifier::new("ftp://example.com/hook", timeout),
            Err(FleetError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_an_error() {
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_millis(500)).unwrap();
        let notification = OptimizerNotification {
            action: OptimizerAction::Pause,
            instance_id: "i-1".to_string(),
            provider: "sim".to_string(),
            reason: "idle".to_string(),
            dry_run: false,
            timestamp: Utc::now(),
        };

        let err = notifier.notify(&notification).await.unwrap_err();
        assert_eq!(err.kind(), "notification");
    }

    #[test]
    fn test_notification_payload() {
        let notification = OptimizerNotification {
            action: OptimizerAction::Delete,
            instance_id: "i-9".to_string(),
            provider: "vast".to_string(),
            reason: "no activity for 30.0h".to_string(),
            dry_run: true,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["action"], "delete");
        assert_eq!(json["dry_run"], true);
    }
}
