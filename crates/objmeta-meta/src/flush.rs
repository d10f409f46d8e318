//! Background flush loop: periodically persists dirty bucket usages.

use crate::accountant::UsageAccountant;
use objmeta_common::RequestContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Run one flush cycle under its own background context.
pub async fn flush_once(accountant: &UsageAccountant) {
    let ctx = RequestContext::background("usage-flush");
    match accountant.sync_dirty_usages(&ctx).await {
        Ok(Some(report)) if report.failed > 0 => info!(
            request_id = ctx.request_id(),
            failed = report.failed,
            "some bucket usages stay dirty until the next flush"
        ),
        Ok(_) => {}
        Err(e) => error!(request_id = ctx.request_id(), "Usage flush failed: {e}"),
    }
}

/// Long-running background task: flush dirty usages every `interval` until
/// `shutdown` turns true (or its sender is dropped), then flush once more.
pub async fn flush_loop(
    accountant: Arc<UsageAccountant>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => flush_once(&accountant).await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Usage flush loop stopping, running final flush");
    flush_once(&accountant).await;
}
