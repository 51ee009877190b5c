//! Outgoing notifications: chat notices and on-call pages.

pub mod pagerduty;
pub mod slack;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::NotifyConfig;
use crate::detect::Severity;
use crate::sources::read_secret;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("no routing key for service '{0}'")]
    UnknownService(String),
}

impl From<reqwest::Error> for NotifyError {
    fn from(e: reqwest::Error) -> Self {
        NotifyError::Transport(e.to_string())
    }
}

/// Check a webhook response, keeping a prefix of the body for the log.
pub(crate) async fn check_response(response: reqwest::Response) -> Result<(), NotifyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(NotifyError::Status {
        status: status.as_u16(),
        body: body.chars().take(200).collect(),
    })
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post a message to a chat channel.
    async fn notify(&self, message: &str, channel: &str, severity: Severity) -> Result<(), NotifyError>;

    /// Page the on-call rotation of `service`.
    async fn page(&self, message: &str, service: &str) -> Result<(), NotifyError>;
}

/// Writes alerts to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str, channel: &str, severity: Severity) -> Result<(), NotifyError> {
        info!(channel = %channel, severity = %severity, "NOTIFY: {}", message);
        Ok(())
    }

    async fn page(&self, message: &str, service: &str) -> Result<(), NotifyError> {
        warn!(service = %service, "PAGE: {}", message);
        Ok(())
    }
}

/// Routes chat notices and pages to whichever backends are configured,
/// logging what has nowhere else to go.
pub struct Dispatcher {
    chat: Option<Box<dyn Notifier>>,
    pager: Option<Box<dyn Notifier>>,
    fallback: LogNotifier,
}

impl Dispatcher {
    pub fn new(chat: Option<Box<dyn Notifier>>, pager: Option<Box<dyn Notifier>>) -> Self {
        Self {
            chat,
            pager,
            fallback: LogNotifier,
        }
    }

    pub fn log_only() -> Self {
        Self::new(None, None)
    }

    /// Build the configured backends. Credentials are read here, once.
    pub fn from_config(config: &NotifyConfig, client: reqwest::Client, dry_run: bool) -> anyhow::Result<Self> {
        if dry_run {
            info!("Dry run: alerts are logged, not delivered");
            return Ok(Self::log_only());
        }

        let chat: Option<Box<dyn Notifier>> = match &config.slack {
            Some(slack) => {
                let url = read_secret(&slack.webhook_url_file).context("slack webhook url")?;
                Some(Box::new(slack::SlackNotifier::new(url, slack.username.clone(), client.clone())))
            }
            None => None,
        };

        let pager: Option<Box<dyn Notifier>> = match &config.pagerduty {
            Some(pd) => {
                let mut keys = std::collections::BTreeMap::new();
                for (service, path) in &pd.routing_key_files {
                    let key = read_secret(path).with_context(|| format!("pagerduty routing key for '{}'", service))?;
                    keys.insert(service.clone(), key);
                }
                Some(Box::new(pagerduty::PagerDutyNotifier::new(pd.events_url.clone(), keys, client)))
            }
            None => None,
        };

        info!(chat = chat.is_some(), pager = pager.is_some(), "Initialized notification backends");
        Ok(Self::new(chat, pager))
    }
}

#[async_trait]
impl Notifier for Dispatcher {
    async fn notify(&self, message: &str, channel: &str, severity: Severity) -> Result<(), NotifyError> {
        match &self.chat {
            Some(chat) => chat.notify(message, channel, severity).await,
            None => self.fallback.notify(message, channel, severity).await,
        }
    }

    async fn page(&self, message: &str, service: &str) -> Result<(), NotifyError> {
        match &self.pager {
            Some(pager) => pager.page(message, service).await,
            None => self.fallback.page(message, service).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, message: &str, channel: &str, _severity: Severity) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(format!("notify {} {}", channel, message));
            Ok(())
        }

        async fn page(&self, _message: &str, service: &str) -> Result<(), NotifyError> {
            Err(NotifyError::UnknownService(service.to_string()))
        }
    }

    #[tokio::test]
    async fn test_dispatcher_routes_and_falls_back() {
        let chat = Recorder::default();
        let dispatcher = Dispatcher::new(Some(Box::new(chat.clone())), None);
        dispatcher.notify("hello", "#bugs", Severity::Warning).await.unwrap();
        // no pager configured: logged, not an error
        dispatcher.page("help", "on-call").await.unwrap();
        assert_eq!(chat.0.lock().unwrap().as_slice(), ["notify #bugs hello"]);

        let dispatcher = Dispatcher::new(None, Some(Box::new(chat)));
        assert!(matches!(
            dispatcher.page("help", "on-call").await,
            Err(NotifyError::UnknownService(s)) if s == "on-call"
        ));
    }

    #[tokio::test]
    async fn test_dry_run_ignores_backends() {
        let config = NotifyConfig {
            slack: Some(crate::config::SlackConfig {
                webhook_url_file: "/nonexistent/slack.cfg".into(),
                username: "bugwatch".into(),
            }),
            pagerduty: None,
        };
        // the credentials file is never read
        assert!(Dispatcher::from_config(&config, reqwest::Client::new(), true).is_ok());
        assert!(Dispatcher::from_config(&config, reqwest::Client::new(), false).is_err());
    }
}
