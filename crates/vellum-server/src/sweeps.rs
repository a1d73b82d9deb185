use crate::config::Config;
use std::time::Duration;
use tokio::task::JoinHandle;
use vellum_core::indexing::LoggingIndexer;
use vellum_ws::GatewayState;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);

/// Start the periodic jobs that keep presence, limiter state, retention and
/// the indexing queue moving.
pub fn spawn_background_tasks(gateway: &GatewayState, config: &Config) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let broker = gateway.broker.clone();
    let every = Duration::from_secs(config.presence.sweep_interval_seconds.max(1));
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // skip immediate first tick
        loop {
            interval.tick().await;
            let expired = broker.sweep_presence();
            if expired > 0 {
                tracing::debug!(expired, "presence sweep");
            }
        }
    }));

    let maintenance = gateway.clone();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let pruned = maintenance.app.limiter.prune();
            maintenance.prune_flood_limits();
            tracing::trace!(pruned, "rate limiter cleanup");
        }
    }));

    if config.retention.enabled {
        let retention = gateway.app.retention.clone();
        let every = Duration::from_secs(config.retention.interval_seconds.max(60));
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match retention.run_scheduled_cleanup().await {
                    Ok(report) => {
                        for (tenant_id, reason) in &report.failures {
                            tracing::warn!(tenant_id, "retention sweep failed: {reason}");
                        }
                        tracing::info!(
                            tenants = report.tenants.len(),
                            removed = report.messages_removed(),
                            failures = report.failures.len(),
                            "retention sweep finished"
                        );
                    }
                    Err(e) => tracing::warn!("retention sweep failed: {e}"),
                }
            }
        }));
    } else {
        tracing::info!("retention sweeps disabled");
    }

    let indexing = gateway.app.indexing.clone();
    let every = Duration::from_secs(config.indexing.interval_seconds.max(1));
    let batch = config.indexing.batch_size.max(1);
    handles.push(tokio::spawn(async move {
        let indexer = LoggingIndexer;
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let run = indexing.run_indexing_hook(&indexer, batch).await;
            if run.indexed > 0 || run.failed > 0 {
                tracing::debug!(indexed = run.indexed, failed = run.failed, "indexing hook");
            }
        }
    }));

    handles
}
