//! 过期上传会话的后台清理任务。

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{PartStore, SweepPolicy, SweepReport};

/// Runs one sweep pass. Failures are logged and swallowed.
pub async fn run_sweep(store: &dyn PartStore, policy: &SweepPolicy) -> Option<SweepReport> {
    match store.sweep(policy, SystemTime::now()).await {
        Ok(report) => {
            if report.deleted > 0 || report.failed > 0 {
                info!(
                    scanned = report.scanned,
                    deleted = report.deleted,
                    failed = report.failed,
                    "upload sweep finished"
                );
            } else {
                debug!(scanned = report.scanned, "upload sweep found nothing stale");
            }
            Some(report)
        }
        Err(err) => {
            warn!(error = %err, "upload sweep failed");
            None
        }
    }
}

/// 启动清理任务，`cancel` 被取消后退出。
pub fn spawn_sweeper(
    store: Arc<dyn PartStore>,
    policy: SweepPolicy,
    every: Duration,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !policy.is_enabled() {
        info!("upload sweeper disabled");
        return None;
    }
    info!(
        every_secs = every.as_secs_f64(),
        max_age_secs = policy.max_age.as_secs_f64(),
        activity = ?policy.activity,
        "upload sweeper started"
    );
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("upload sweeper stopped");
                    break;
                }
                _ = interval.tick() => {
                    run_sweep(store.as_ref(), &policy).await;
                }
            }
        }
    }))
}
