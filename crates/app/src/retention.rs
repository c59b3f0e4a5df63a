use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use stamphog_storage::{Database, StorageError};

pub const RETENTION_DAYS: i64 = 90;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);

/// Background worker that prunes records past the retention window and
/// garbage-collects actor profiles nothing references anymore.
#[derive(Clone)]
pub struct RetentionWorker {
    storage: Database,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    interval: Duration,
}

impl RetentionWorker {
    /// Creates a worker with default clock and cadence.
    pub fn new(storage: Database) -> Self {
        Self {
            storage,
            clock: Arc::new(Utc::now),
            interval: DEFAULT_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "retention", error = %err, "retention sweep failed");
            }
        }
    }

    /// Executes one retention sweep.
    pub async fn run_once(&self) -> Result<PruneSummary, StorageError> {
        run_prune(&self.storage, (self.clock)()).await
    }
}

/// Prunes in two explicit phases: delete stale records first, then recompute
/// the referenced-actor set and drop orphans. Recomputing after the deletes
/// is what keeps a profile referenced by any surviving record safe.
pub async fn run_prune(
    storage: &Database,
    now: DateTime<Utc>,
) -> Result<PruneSummary, StorageError> {
    let cutoff = now - ChronoDuration::days(RETENTION_DAYS);

    let deleted_requests = storage.requests().delete_older_than(cutoff).await?;
    counter!("db_retention_deleted_total", "table" => "requests").increment(deleted_requests);
    let deleted_stamp_events = storage.stamp_events().delete_older_than(cutoff).await?;
    counter!("db_retention_deleted_total", "table" => "stamp_events")
        .increment(deleted_stamp_events);

    let referenced = storage.referenced_actor_ids().await?;
    let deleted_actors = storage.actors().delete_unreferenced(&referenced).await?;
    counter!("db_retention_deleted_total", "table" => "actors").increment(deleted_actors);

    let summary = PruneSummary {
        retention_days: RETENTION_DAYS,
        cutoff,
        deleted_requests,
        deleted_stamp_events,
        deleted_actors,
        remaining: RemainingCounts {
            requests: storage.requests().count().await?,
            stamp_events: storage.stamp_events().count().await?,
            actors: storage.actors().count().await?,
        },
    };

    info!(
        stage = "retention",
        cutoff = %cutoff.to_rfc3339(),
        deleted_requests = summary.deleted_requests,
        deleted_stamp_events = summary.deleted_stamp_events,
        deleted_actors = summary.deleted_actors,
        "retention sweep completed"
    );

    Ok(summary)
}

/// Result of one retention sweep.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneSummary {
    pub retention_days: i64,
    pub cutoff: DateTime<Utc>,
    pub deleted_requests: u64,
    pub deleted_stamp_events: u64,
    pub deleted_actors: u64,
    pub remaining: RemainingCounts,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemainingCounts {
    pub requests: u64,
    pub stamp_events: u64,
    pub actors: u64,
}
