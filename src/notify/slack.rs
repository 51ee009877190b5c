use async_trait::async_trait;
use serde_json::json;

use super::{check_response, Notifier, NotifyError};
use crate::detect::Severity;

/// Slack incoming webhook.
pub struct SlackNotifier {
    webhook_url: String,
    username: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String, username: String, client: reqwest::Client) -> Self {
        Self {
            webhook_url,
            username,
            client,
        }
    }

    fn severity_color(severity: Severity) -> &'static str {
        match severity {
            Severity::Info => "#2ecc71",
            Severity::Warning => "#f39c12",
            Severity::Critical => "#e74c3c",
        }
    }

    fn payload(&self, message: &str, channel: &str, severity: Severity) -> serde_json::Value {
        json!({
            "channel": channel,
            "username": &self.username,
            "attachments": [{
                "color": Self::severity_color(severity),
                "fallback": message,
                "text": message,
            }]
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, message: &str, channel: &str, severity: Severity) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&self.payload(message, channel, severity))
            .send()
            .await?;
        check_response(response).await
    }

    async fn page(&self, message: &str, service: &str) -> Result<(), NotifyError> {
        // Chat-only backend: a page lands in the channel named after the service.
        self.notify(message, service, Severity::Critical).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload() {
        let slack = SlackNotifier::new("http://localhost/hook".into(), "bugwatch".into(), reqwest::Client::new());
        let p = slack.payload("spike!", "#1s-and-0s", Severity::Warning);
        assert_eq!(p["channel"], "#1s-and-0s");
        assert_eq!(p["username"], "bugwatch");
        assert_eq!(p["attachments"][0]["color"], "#f39c12");
        assert_eq!(p["attachments"][0]["text"], "spike!");
    }
}
