use std::future::Future;

use chrono::Utc;
use tracing::{error, info};

use crate::scheduler::Ticker;

/// Watch loop: call `tick` at every fire time of `ticker` until `shutdown`
/// resolves. A tick that fails is logged and the loop carries on.
pub async fn run_watch_loop<F, Fut, S>(ticker: Ticker, mut tick: F, shutdown: S)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
    S: Future<Output = ()>,
{
    info!(cron = %ticker.expr(), "Watch loop started");
    tokio::pin!(shutdown);

    loop {
        let now = Utc::now();
        let Some(next) = ticker.next_tick(now) else {
            error!(cron = %ticker.expr(), "Schedule has no future fire times, stopping");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next = %next, "Waiting for next tick");

        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, leaving watch loop");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        if let Err(e) = tick().await {
            error!("Tick failed: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_does_not_stop_the_loop() {
        let ticker = Ticker::new("* * * * * *").unwrap();
        let ticks = Cell::new(0u32);
        let shutdown = tokio::time::sleep(std::time::Duration::from_millis(3500));
        run_watch_loop(
            ticker,
            || {
                ticks.set(ticks.get() + 1);
                async { Err(anyhow::anyhow!("source down")) }
            },
            shutdown,
        )
        .await;
        assert!(ticks.get() >= 2, "ticks = {}", ticks.get());
    }
}
