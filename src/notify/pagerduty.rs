//! PagerDuty Events API v2.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use super::{check_response, Notifier, NotifyError};
use crate::detect::Severity;

pub struct PagerDutyNotifier {
    events_url: String,
    routing_keys: BTreeMap<String, String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct Event<'a> {
    routing_key: &'a str,
    event_action: &'static str,
    payload: EventPayload,
}

#[derive(Debug, Serialize)]
struct EventPayload {
    summary: String,
    source: &'static str,
    severity: &'static str,
}

impl PagerDutyNotifier {
    pub fn new(events_url: String, routing_keys: BTreeMap<String, String>, client: reqwest::Client) -> Self {
        Self {
            events_url,
            routing_keys,
            client,
        }
    }

    fn event<'a>(&'a self, message: &str, service: &str, severity: &'static str) -> Result<Event<'a>, NotifyError> {
        let routing_key = self
            .routing_keys
            .get(service)
            .ok_or_else(|| NotifyError::UnknownService(service.to_string()))?;
        Ok(Event {
            routing_key,
            event_action: "trigger",
            payload: EventPayload {
                // PagerDuty caps summaries at 1024 characters.
                summary: message.chars().take(1024).collect(),
                source: "bugwatch",
                severity,
            },
        })
    }

    async fn send(&self, event: &Event<'_>) -> Result<(), NotifyError> {
        let response = self.client.post(&self.events_url).json(event).send().await?;
        check_response(response).await
    }
}

#[async_trait]
impl Notifier for PagerDutyNotifier {
    async fn notify(&self, message: &str, channel: &str, severity: Severity) -> Result<(), NotifyError> {
        let level = match severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        let event = self.event(message, channel, level)?;
        self.send(&event).await
    }

    async fn page(&self, message: &str, service: &str) -> Result<(), NotifyError> {
        let event = self.event(message, service, "critical")?;
        self.send(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> PagerDutyNotifier {
        let mut keys = BTreeMap::new();
        keys.insert("bugwatch".to_string(), "R0UT1NG".to_string());
        PagerDutyNotifier::new("http://localhost/enqueue".into(), keys, reqwest::Client::new())
    }

    #[test]
    fn test_event_body() {
        let n = notifier();
        let event = n.event("spike", "bugwatch", "critical").unwrap();
        let body = serde_json::to_value(&event).unwrap();
        assert_eq!(body["routing_key"], "R0UT1NG");
        assert_eq!(body["event_action"], "trigger");
        assert_eq!(body["payload"]["summary"], "spike");
        assert_eq!(body["payload"]["severity"], "critical");
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let err = notifier().page("spike", "elsewhere").await.unwrap_err();
        assert!(matches!(err, NotifyError::UnknownService(s) if s == "elsewhere"));
    }
}
