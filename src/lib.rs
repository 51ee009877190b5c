//! bugwatch -- early warning of product regressions from bug-report volume.
//!
//! Each configured source (helpdesk, issue tracker, feedback forum) is polled
//! incrementally; new reports are counted per dimension and compared against
//! a durable baseline with a Poisson model, and spikes are sent to chat and
//! on-call.

pub mod baseline;
pub mod classify;
pub mod config;
pub mod detect;
pub mod fetch;
pub mod notify;
pub mod runner;
pub mod scheduler;
pub mod sources;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::{ApiConfig, Config, SourceConfig};
use crate::detect::policy::AlertPolicy;
use crate::notify::{Dispatcher, Notifier};
use crate::runner::{RunReport, SourceRunner, SourceSettings};
use crate::sources::{github, jira, read_secret, uservoice, zendesk, Source};
use crate::storage::BaselineStore;

/// Build the adapter for one configured source. Credentials are read here.
pub fn build_source(config: &SourceConfig, client: reqwest::Client) -> Result<Box<dyn Source>> {
    let name = config.name.as_str();
    let source: Box<dyn Source> = match &config.api {
        ApiConfig::Zendesk {
            base_url,
            user,
            password_file,
        } => Box::new(zendesk::ZendeskSource::new(
            name,
            base_url,
            user,
            read_secret(password_file)?,
            client,
        )),
        ApiConfig::Jira {
            base_url,
            user,
            password_file,
            jql,
            dimension_field,
        } => Box::new(jira::JiraSource::new(
            name,
            base_url,
            user,
            read_secret(password_file)?,
            jql,
            dimension_field,
            client,
        )),
        ApiConfig::Github {
            owner,
            repo,
            api_base,
            token_file,
            dimension_prefix,
            dimension_suffix,
            relay_logins,
        } => {
            let token = token_file.as_deref().map(read_secret).transpose()?;
            Box::new(github::GithubSource::new(
                name,
                api_base.as_deref(),
                owner,
                repo,
                token,
                dimension_prefix.clone(),
                dimension_suffix.clone(),
                client,
            )
            .with_relay_logins(relay_logins.clone()))
        }
        ApiConfig::Uservoice {
            base_url,
            forum_id,
            api_key_file,
        } => Box::new(uservoice::UservoiceSource::new(
            name,
            base_url,
            *forum_id,
            read_secret(api_key_file)?,
            client,
        )),
    };
    Ok(source)
}

/// Resolve a source's settings against the global defaults.
pub fn source_settings(config: &Config, source: &SourceConfig) -> SourceSettings {
    let alerting = &config.alerting;
    let policy = AlertPolicy::new(
        config.thresholds_for(source),
        alerting.policy,
        source.channel.clone().unwrap_or_else(|| alerting.channel.clone()),
        source.page_service.clone().or_else(|| alerting.page_service.clone()),
    );
    SourceSettings {
        classifier: source.classifier.clone(),
        policy,
        bucketing: source.bucketing,
        lookback: source.lookback_days.map(chrono::Duration::days),
        freshness_lag: source.freshness_lag_secs.map(chrono::Duration::seconds),
        retry: config.fetch.retry.clone(),
        max_pages: config.fetch.max_pages,
        link: source.link.clone(),
    }
}

/// Everything a process needs: the store and one runner per enabled source.
pub struct App {
    store: BaselineStore,
    runners: Vec<SourceRunner>,
}

impl App {
    pub fn new(store: BaselineStore, runners: Vec<SourceRunner>) -> Self {
        Self { store, runners }
    }

    pub fn from_config(config: &Config, dry_run: bool) -> Result<Self> {
        info!(path = %config.storage.database.display(), "Opening baseline store");
        let store = BaselineStore::open(&config.storage.database)
            .with_context(|| format!("failed to open store {}", config.storage.database.display()))?;

        let client = sources::http::client(Duration::from_secs(config.fetch.request_timeout_secs))
            .context("failed to build HTTP client")?;
        let notifier: Arc<dyn Notifier> = Arc::new(Dispatcher::from_config(&config.notify, client.clone(), dry_run)?);

        let mut runners = Vec::new();
        for source in config.sources.iter().filter(|s| s.enabled) {
            let adapter = build_source(source, client.clone())
                .with_context(|| format!("failed to set up source '{}'", source.name))?;
            runners.push(SourceRunner::new(
                adapter,
                source_settings(config, source),
                store.clone(),
                notifier.clone(),
            ));
        }
        info!(sources = runners.len(), dry_run, "bugwatch ready");
        Ok(Self::new(store, runners))
    }

    pub fn store(&self) -> &BaselineStore {
        &self.store
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.runners.iter().map(|r| r.name()).collect()
    }

    /// Run every source (or just `only`) once, in configuration order.
    /// A failed source is logged and does not stop the others.
    pub async fn run_all(&self, only: Option<&str>) -> Result<Sweep> {
        if let Some(name) = only {
            if !self.runners.iter().any(|r| r.name() == name) {
                anyhow::bail!("no enabled source named '{}'", name);
            }
        }

        let mut sweep = Sweep::default();
        for runner in self.runners.iter().filter(|r| only.map_or(true, |n| r.name() == n)) {
            match runner.run(chrono::Utc::now()).await {
                Ok(report) => sweep.reports.push(report),
                Err(e) => {
                    error!(source = %runner.name(), "Run failed: {:#}", e);
                    sweep.failures.push((runner.name().to_string(), format!("{:#}", e)));
                }
            }
        }
        Ok(sweep)
    }
}

/// Result of one pass over the sources.
#[derive(Debug, Default)]
pub struct Sweep {
    pub reports: Vec<RunReport>,
    /// Source name and error of every run that aborted.
    pub failures: Vec<(String, String)>,
}

impl Sweep {
    pub fn into_result(self) -> Result<Vec<RunReport>> {
        if self.failures.is_empty() {
            return Ok(self.reports);
        }
        let names: Vec<&str> = self.failures.iter().map(|(n, _)| n.as_str()).collect();
        anyhow::bail!("{} source(s) failed: {}", names.len(), names.join(", "))
    }
}
