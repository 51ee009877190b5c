use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use bugwatch::baseline::{BaselineEntry, BaselineKey};
use bugwatch::config::Config;
use bugwatch::detect::incident::IncidentManager;
use bugwatch::runner::{DeliveryOutcome, RunReport, RunStatus};
use bugwatch::scheduler::{run_watch_loop, Ticker};
use bugwatch::storage::BaselineStore;
use bugwatch::App;

#[derive(Parser)]
#[command(
    name = "bugwatch",
    about = "Early warning of product regressions from bug-report volume spikes",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: $BUGWATCH_CONFIG, then /etc/bugwatch/bugwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "BUGWATCH_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every enabled source once
    Run {
        /// Only this source
        #[arg(long)]
        source: Option<String>,

        /// Log alerts instead of delivering them
        #[arg(long)]
        dry_run: bool,
    },

    /// Poll on the configured cron schedule until interrupted
    Watch {
        /// Log alerts instead of delivering them
        #[arg(long)]
        dry_run: bool,
    },

    /// Show stored baselines and recent incidents
    Status {
        /// Only this source
        #[arg(long)]
        source: Option<String>,

        /// Number of recent incidents to list
        #[arg(long, default_value = "10")]
        incidents: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Overwrite a baseline with an operator-chosen rate
    ResetBaseline {
        #[arg(long)]
        source: String,

        /// Dimension key (`all` for the source total)
        #[arg(long)]
        key: String,

        /// Bucket (weekday, weekend, on-hours, off-hours) when the source is bucketed
        #[arg(long)]
        bucket: Option<String>,

        /// Expected reports per hour
        #[arg(long)]
        per_hour: f64,

        /// Observation window the rate stands for, in hours
        #[arg(long, default_value = "168")]
        window_hours: f64,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_report(report: &RunReport) {
    if report.status == RunStatus::NotReady {
        println!("{}: period ending {} not ready yet", report.source, report.period_end);
        return;
    }
    println!(
        "{}: {} -> {}  fetched {}  counted {}  dropped {}",
        report.source,
        report.period_start.format("%Y-%m-%d %H:%M:%S"),
        report.period_end.format("%Y-%m-%d %H:%M:%S"),
        report.fetched,
        report.counted,
        report.dropped
    );
    for s in &report.summaries {
        println!(
            "  {:<30} | {:>6} | mean {:>10.2} | p {:.4} | {}",
            s.key, s.new_count, s.mean, s.probability, s.level
        );
    }
    for d in &report.deliveries {
        let outcome = match &d.outcome {
            DeliveryOutcome::Sent => "sent".to_string(),
            DeliveryOutcome::Failed(e) => format!("FAILED: {}", e),
        };
        println!("  -> {} {} ({}): {}", d.action.kind(), d.action.target(), d.key, outcome);
    }
}

fn status(store: &BaselineStore, source: Option<&str>, incidents: usize, json: bool) -> Result<()> {
    let names = match source {
        Some(name) => vec![name.to_string()],
        None => store.sources()?,
    };
    let recent = IncidentManager::new(store.pool().clone()).list_recent(source, incidents)?;

    if json {
        let mut sources = Vec::new();
        for name in &names {
            let state = store.load(name)?;
            let entries: Vec<_> = state
                .entries
                .iter()
                .map(|(k, e)| {
                    serde_json::json!({
                        "bucket": k.bucket,
                        "key": k.dimension,
                        "observed_count": e.observed_count,
                        "elapsed_secs": e.elapsed_secs,
                        "rate_per_hour": e.rate_per_hour(),
                        "alert_level": e.alert_level,
                    })
                })
                .collect();
            sources.push(serde_json::json!({
                "source": name,
                "checkpoint": state.checkpoint,
                "baselines": entries,
            }));
        }
        let out = serde_json::json!({ "sources": sources, "incidents": recent });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if names.is_empty() {
        println!("No stored state yet.");
    }
    for name in &names {
        let state = store.load(name)?;
        let period_end = state
            .checkpoint
            .period_end
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!("\n=== {} (last period end: {}) ===", name, period_end);
        println!("{:<35} | {:>10} | {:>12} | {:>9} | Level", "Key", "Count", "Hours", "Per hour");
        println!("{:-<35}-|-{:-<10}-|-{:-<12}-|-{:-<9}-|-{:-<8}", "", "", "", "", "");
        for (key, entry) in &state.entries {
            println!(
                "{:<35} | {:>10} | {:>12.1} | {:>9.3} | {}",
                key.to_string(),
                entry.observed_count,
                entry.elapsed_secs / 3600.0,
                entry.rate_per_hour(),
                entry.alert_level
            );
        }
    }

    if !recent.is_empty() {
        println!("\n=== Recent incidents ===");
        for i in &recent {
            let delivered = if i.delivered { "delivered" } else { "FAILED" };
            println!(
                "{} | {:<10} | {:<20} | {:<8} | {} {} | {}",
                i.created_at.format("%Y-%m-%d %H:%M"),
                i.source,
                i.key,
                i.severity,
                i.action,
                i.target,
                delivered
            );
        }
    }
    println!();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = Config::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { source, dry_run } => {
            let app = App::from_config(&config, dry_run)?;
            let sweep = app.run_all(source.as_deref()).await?;
            for report in &sweep.reports {
                print_report(report);
            }
            for (name, error) in &sweep.failures {
                eprintln!("{}: FAILED: {}", name, error);
            }
            sweep.into_result()?;
        }
        Commands::Watch { dry_run } => {
            let app = App::from_config(&config, dry_run)?;
            let ticker = Ticker::new(&config.schedule.cron)?;
            tracing::info!(sources = ?app.source_names(), "Starting watch");
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for ctrl-c: {}", e);
                    std::future::pending::<()>().await;
                }
            };
            run_watch_loop(
                ticker,
                || {
                    let app = &app;
                    async move { app.run_all(None).await?.into_result().map(|_| ()) }
                },
                shutdown,
            )
            .await;
        }
        Commands::Status {
            source,
            incidents,
            json,
        } => {
            let store = BaselineStore::open(&config.storage.database)
                .with_context(|| format!("failed to open store {}", config.storage.database.display()))?;
            status(&store, source.as_deref(), incidents, json)?;
        }
        Commands::ResetBaseline {
            source,
            key,
            bucket,
            per_hour,
            window_hours,
        } => {
            if !(per_hour.is_finite() && per_hour >= 0.0) {
                anyhow::bail!("--per-hour must be a non-negative number");
            }
            if !(window_hours.is_finite() && window_hours > 0.0) {
                anyhow::bail!("--window-hours must be positive");
            }
            if config.source(&source).is_none() {
                tracing::warn!(%source, "Source is not in the configuration");
            }
            let entry = BaselineEntry::with_rate(per_hour, window_hours);
            if per_hour > 0.0 && entry.observed_count == 0 {
                anyhow::bail!(
                    "--per-hour {} over {} hours rounds to 0 reports; use a longer --window-hours",
                    per_hour,
                    window_hours
                );
            }
            let stored = entry.rate_per_hour();
            if per_hour > 0.0 && ((stored - per_hour) / per_hour).abs() > 0.05 {
                tracing::warn!(requested = per_hour, stored, "Stored rate differs from the requested rate after rounding");
            }
            let store = BaselineStore::open(&config.storage.database)
                .with_context(|| format!("failed to open store {}", config.storage.database.display()))?;
            let key = BaselineKey::new(bucket, key);
            store.reset_entry(&source, &key, &entry)?;
            println!(
                "Baseline {}/{} reset: {} reports over {} hours ({:.3}/hour).",
                source,
                key,
                entry.observed_count,
                window_hours,
                entry.rate_per_hour()
            );
        }
    }

    Ok(())
}
