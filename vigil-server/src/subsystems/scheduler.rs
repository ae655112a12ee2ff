//! Periodic pipeline trigger.

use std::sync::Arc;
use tokio::sync::broadcast;

use super::pipeline::Pipeline;
use super::run_control::{RunController, RunError};

/// Starts a run every `interval_minutes`. A tick that lands while a run is
/// still active is skipped.
pub async fn run_schedule_loop(
    controller: Arc<RunController>,
    pipeline: Arc<Pipeline>,
    interval_minutes: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval = tokio::time::Duration::from_secs(interval_minutes.max(1) * 60);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; runs are only scheduled after one interval.
    ticker.tick().await;

    tracing::info!("Schedule loop started (interval: {}min)", interval_minutes);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pipeline = Arc::clone(&pipeline);
                match controller.start(move |reporter| async move { pipeline.run(&reporter).await }) {
                    Ok(()) => tracing::info!("Scheduled pipeline run started"),
                    Err(RunError::AlreadyRunning) => {
                        tracing::debug!("Scheduled run skipped: a run is already active")
                    }
                    Err(e) => tracing::error!("Scheduled run failed to start: {}", e),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Schedule loop shutting down");
                break;
            }
        }
    }
}
