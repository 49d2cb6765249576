//! Worker liveness from session heartbeats.
//!
//! Sessions only record heartbeats. Deciding which workers are stale belongs to external
//! monitors, which use `classify_workers`; workers keep their entry fresh with
//! `run_heartbeat`.

use std::collections::HashMap;
use std::time::Duration;

use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLiveness {
    pub worker_id: String,
    /// Unix seconds, 0 if never seen.
    pub last_seen: i64,
    pub age_secs: Option<u64>,
    pub stale: bool,
}

/// Classify every worker in a heartbeat hash, sorted by worker id.
///
/// A worker is stale when its last heartbeat is more than `stale_after` old or was never
/// recorded. Timestamps in the future count as age zero.
pub fn classify_workers(
    heartbeats: &HashMap<String, i64>,
    now: i64,
    stale_after: Duration,
) -> Vec<WorkerLiveness> {
    let mut workers: Vec<WorkerLiveness> = heartbeats
        .iter()
        .map(|(worker_id, &last_seen)| {
            let age_secs = if last_seen > 0 {
                Some(now.saturating_sub(last_seen).max(0) as u64)
            } else {
                None
            };
            let stale = age_secs.is_none_or(|age| age > stale_after.as_secs());

            WorkerLiveness {
                worker_id: worker_id.clone(),
                last_seen,
                age_secs,
                stale,
            }
        })
        .collect();

    workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    workers
}

/// Record a heartbeat every `interval` until shutdown or until the session stops.
///
/// Connectivity errors are logged and retried on the next tick. Any other error, such as
/// a stopped manager, ends the loop.
#[tracing::instrument(skip(session, shutdown), fields(session_id = %session.id()))]
pub async fn run_heartbeat(
    session: Session,
    worker_id: String,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        tracing::debug!("Heartbeat: shutdown already requested, not starting");
        return;
    }

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!("Heartbeat: shutdown signal received, exiting");
                    break;
                }
                continue;
            }
        }

        match session.is_alive().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("Heartbeat: session is no longer alive, exiting");
                break;
            }
            Err(e) if e.is_connectivity() => {
                tracing::warn!("Heartbeat: liveness check failed: {}", e);
                continue;
            }
            Err(e) => {
                tracing::warn!("Heartbeat: giving up: {}", e);
                break;
            }
        }

        if let Err(e) = session.add_heartbeat(&worker_id).await {
            tracing::warn!("Heartbeat: write failed: {}", e);
        }
    }
}
