//! Background workers: the fast threshold loop, the two nightly cron
//! sweeps, the hourly stale-approval inspector, and the delivery sweeper.
//! Each is a detached `tokio` task owning an `Arc` onto shared service
//! state, in the same spawn-and-forget style as the source's digest worker.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::services::{delivery::DeliveryEngine, threshold_monitor::ThresholdMonitor};

/// Runs `ThresholdMonitor::run_fast_loop_once` on a fixed interval for as
/// long as the process lives, waiting out `initial_delay` before the first
/// tick.
pub fn spawn_threshold_monitor(monitor: Arc<ThresholdMonitor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(monitor.initial_delay()).await;
        let interval = monitor.fast_loop_interval();
        loop {
            if let Err(err) = monitor.run_fast_loop_once().await {
                warn!(error = %err, "threshold monitor fast loop iteration failed");
            }
            tokio::time::sleep(interval).await;
        }
    })
}

/// Runs `ThresholdMonitor::run_time_based_sweep_once` at each firing of the
/// configured `time_based_cron` expression (02:00 by default).
pub fn spawn_threshold_time_based_sweep(monitor: Arc<ThresholdMonitor>) -> JoinHandle<()> {
    spawn_cron_job(monitor.time_based_cron().to_string(), "time-based threshold sweep", move || {
        let monitor = Arc::clone(&monitor);
        async move { monitor.run_time_based_sweep_once().await.map(|_| ()) }
    })
}

/// Runs `ThresholdMonitor::run_cleanup_sweep_once` at each firing of the
/// configured `cleanup_cron` expression (03:00 by default).
pub fn spawn_threshold_cleanup_sweep(monitor: Arc<ThresholdMonitor>) -> JoinHandle<()> {
    spawn_cron_job(monitor.cleanup_cron().to_string(), "cleanup sweep", move || {
        let monitor = Arc::clone(&monitor);
        async move { monitor.run_cleanup_sweep_once().await.map(|_| ()) }
    })
}

/// Runs `ThresholdMonitor::run_hourly_inspection_once` once an hour, flagging
/// buckets stuck in `pending_approval`.
pub fn spawn_stale_approval_inspector(monitor: Arc<ThresholdMonitor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(3600);
        loop {
            tokio::time::sleep(interval).await;
            if let Err(err) = monitor.run_hourly_inspection_once().await {
                warn!(error = %err, "hourly stale-approval inspection failed");
            }
        }
    })
}

/// Shared cron-driven loop body: parses `cron_expr` once, then sleeps until
/// each upcoming firing time and runs `job`. An unparsable expression or an
/// exhausted schedule is logged and the task exits rather than looping on a
/// broken schedule.
fn spawn_cron_job<F, Fut>(cron_expr: String, label: &'static str, job: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), crate::services::errors::ServiceError>> + Send,
{
    tokio::spawn(async move {
        let schedule = match Schedule::from_str(&cron_expr) {
            Ok(schedule) => schedule,
            Err(err) => {
                error!(error = %err, cron = cron_expr, label, "invalid cron expression; job disabled");
                return;
            }
        };

        loop {
            let Some(next_fire) = schedule.upcoming(Utc).next() else {
                error!(label, "cron schedule produced no further firing times; job disabled");
                return;
            };
            let now = Utc::now();
            if next_fire > now {
                let wait = (next_fire - now).to_std().unwrap_or(std::time::Duration::from_secs(0));
                tokio::time::sleep(wait).await;
            }
            if let Err(err) = job().await {
                warn!(error = %err, label, "cron job iteration failed");
            }
        }
    })
}

/// Runs `DeliveryEngine::sweep_pending_deliveries` on a fixed interval,
/// picking up both freshly generated files and retry-eligible ones in the
/// same pass.
pub fn spawn_delivery_sweeper(engine: Arc<DeliveryEngine>, sweep_interval_seconds: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(sweep_interval_seconds);
        loop {
            tokio::time::sleep(interval).await;
            match engine.sweep_pending_deliveries().await {
                Ok(attempted) if attempted > 0 => info!(attempted, "delivery sweep attempted deliveries"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "delivery sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_expressions_parse() {
        assert!(Schedule::from_str("0 0 2 * * *").is_ok());
        assert!(Schedule::from_str("0 0 3 * * *").is_ok());
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        let schedule = Schedule::from_str("not a cron expression");
        assert!(schedule.is_err());
    }
}
