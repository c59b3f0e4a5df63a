use std::collections::{HashMap, HashSet};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError, sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;
use uuid::Uuid;

use stamphog_core::keys::stamp_source;

/// SQLite extended result code for a unique-constraint violation. Losing one
/// of two concurrent inserts for the same dedupe key surfaces as this code;
/// the loser reports itself as a duplicate instead of an error.
const SQLITE_UNIQUE_VIOLATION: &str = "2067";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for actor profile rows.
    pub fn actors(&self) -> ActorRepository {
        ActorRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for request records.
    pub fn requests(&self) -> RequestRepository {
        RequestRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for stamp events.
    pub fn stamp_events(&self) -> StampEventRepository {
        StampEventRepository {
            pool: self.pool.clone(),
        }
    }

    /// Collects every actor id still referenced by a request or stamp event.
    ///
    /// Retention pruning recomputes this set after deleting stale records and
    /// before touching any profile, so a profile referenced by a surviving
    /// record is never collected.
    pub async fn referenced_actor_ids(&self) -> Result<HashSet<String>, StorageError> {
        let rows = sqlx::query(
            "SELECT requester_id AS actor_id FROM requests \
             UNION SELECT giver_id FROM stamp_events \
             UNION SELECT requester_id FROM stamp_events",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("actor_id"))
            .collect())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Outcome of an idempotent ingest call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub duplicate: bool,
    pub id: String,
}

/// Repository for actor display profiles.
#[derive(Clone)]
pub struct ActorRepository {
    pool: SqlitePool,
}

impl ActorRepository {
    /// Lists every stored profile keyed by actor id.
    pub async fn profile_map(&self) -> Result<HashMap<String, ActorProfile>, StorageError> {
        let rows = sqlx::query("SELECT actor_id, display_name, image_url FROM actors")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("actor_id"),
                    ActorProfile {
                        display_name: row.get("display_name"),
                        image_url: row.get("image_url"),
                    },
                )
            })
            .collect())
    }

    /// Deletes profiles whose actor id is absent from `referenced`.
    pub async fn delete_unreferenced(
        &self,
        referenced: &HashSet<String>,
    ) -> Result<u64, StorageError> {
        let rows = sqlx::query("SELECT actor_id FROM actors")
            .fetch_all(&self.pool)
            .await?;

        let mut deleted = 0u64;
        for row in rows {
            let actor_id: String = row.get("actor_id");
            if referenced.contains(&actor_id) {
                continue;
            }
            let result = sqlx::query("DELETE FROM actors WHERE actor_id = ?")
                .bind(&actor_id)
                .execute(&self.pool)
                .await?;
            deleted += result.rows_affected();
        }

        Ok(deleted)
    }

    /// Counts stored profiles.
    pub async fn count(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM actors")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

/// Display profile resolved for an actor id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorProfile {
    pub display_name: String,
    pub image_url: Option<String>,
}

/// Upserts a profile row inside the caller's transaction. Absent display
/// fields never erase values learned from an earlier lookup; a brand-new
/// actor without a display name falls back to the raw id.
async fn upsert_actor(
    tx: &mut Transaction<'_, Sqlite>,
    actor_id: &str,
    display_name: Option<&str>,
    image_url: Option<&str>,
    updated_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let updated_at = to_rfc3339(updated_at);
    sqlx::query(
        "INSERT INTO actors (id, actor_id, display_name, image_url, updated_at) \
         VALUES (?, ?, COALESCE(?, ?), ?, ?) \
         ON CONFLICT(actor_id) DO UPDATE SET \
             display_name = COALESCE(?, display_name), \
             image_url = COALESCE(?, image_url), \
             updated_at = ?",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(actor_id)
    .bind(display_name)
    .bind(actor_id)
    .bind(image_url)
    .bind(&updated_at)
    .bind(display_name)
    .bind(image_url)
    .bind(&updated_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Repository for qualifying request messages.
#[derive(Clone)]
pub struct RequestRepository {
    pool: SqlitePool,
}

impl RequestRepository {
    /// Idempotently records a request message.
    ///
    /// An existing record under the same dedupe key only has its `pr_url`
    /// refreshed (message edits may change the link); everything else,
    /// `occurred_at` included, stays as first written.
    pub async fn ingest(&self, record: NewRequest<'_>) -> Result<IngestOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;

        upsert_actor(
            &mut tx,
            record.requester_id,
            record.requester_display_name,
            record.requester_image_url,
            record.ingested_at,
        )
        .await?;

        let existing = sqlx::query("SELECT id FROM requests WHERE dedupe_key = ?")
            .bind(record.dedupe_key)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = existing {
            let id: String = row.get("id");
            sqlx::query("UPDATE requests SET pr_url = ? WHERE id = ?")
                .bind(record.pr_url)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(IngestOutcome {
                duplicate: true,
                id,
            });
        }

        let id = Uuid::new_v4().to_string();
        let occurred_at = record.occurred_at.unwrap_or(record.ingested_at);
        let insert = sqlx::query(
            "INSERT INTO requests \
             (id, requester_id, channel_id, message_ref, occurred_at, pr_url, dedupe_key) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(record.requester_id)
        .bind(record.channel_id)
        .bind(record.message_ref)
        .bind(to_rfc3339(occurred_at))
        .bind(record.pr_url)
        .bind(record.dedupe_key)
        .execute(&mut *tx)
        .await;

        match insert {
            Ok(_) => {
                tx.commit().await?;
                Ok(IngestOutcome {
                    duplicate: false,
                    id,
                })
            }
            Err(err) if is_unique_violation(&err) => {
                // lost the insert race; the winner's row carries the record
                let row = sqlx::query("SELECT id FROM requests WHERE dedupe_key = ?")
                    .bind(record.dedupe_key)
                    .fetch_one(&mut *tx)
                    .await?;
                let id: String = row.get("id");
                sqlx::query("UPDATE requests SET pr_url = ? WHERE id = ?")
                    .bind(record.pr_url)
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(IngestOutcome {
                    duplicate: true,
                    id,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Lists requests, optionally bounded to those at or after `since`.
    pub async fn list_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RequestRow>, StorageError> {
        let rows = match since {
            Some(since) => {
                sqlx::query_as::<_, RequestRow>(
                    "SELECT id, requester_id, channel_id, message_ref, occurred_at, pr_url, dedupe_key \
                     FROM requests WHERE occurred_at >= ? ORDER BY occurred_at ASC",
                )
                .bind(to_rfc3339(since))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, RequestRow>(
                    "SELECT id, requester_id, channel_id, message_ref, occurred_at, pr_url, dedupe_key \
                     FROM requests ORDER BY occurred_at ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// Lists the most recent requests, newest first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<RequestRow>, StorageError> {
        let rows = sqlx::query_as::<_, RequestRow>(
            "SELECT id, requester_id, channel_id, message_ref, occurred_at, pr_url, dedupe_key \
             FROM requests ORDER BY occurred_at DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Deletes requests older than `cutoff`, returning the number removed.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM requests WHERE occurred_at < ?")
            .bind(to_rfc3339(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Counts stored requests.
    pub async fn count(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

/// Data required to ingest a request message.
#[derive(Debug, Clone)]
pub struct NewRequest<'a> {
    pub requester_id: &'a str,
    pub requester_display_name: Option<&'a str>,
    pub requester_image_url: Option<&'a str>,
    pub channel_id: &'a str,
    pub message_ref: &'a str,
    pub occurred_at: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
    pub pr_url: &'a str,
    pub dedupe_key: &'a str,
}

/// Stored request row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RequestRow {
    pub id: String,
    pub requester_id: String,
    pub channel_id: String,
    pub message_ref: String,
    pub occurred_at: DateTime<Utc>,
    pub pr_url: String,
    pub dedupe_key: String,
}

/// Repository for reviewer stamp events.
#[derive(Clone)]
pub struct StampEventRepository {
    pool: SqlitePool,
}

impl StampEventRepository {
    /// Idempotently records one reviewer stamp.
    ///
    /// Both referenced actor profiles are refreshed regardless of whether the
    /// event row is new; a pre-existing dedupe key leaves the event untouched.
    pub async fn ingest(&self, record: NewStampEvent<'_>) -> Result<IngestOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;

        upsert_actor(
            &mut tx,
            record.giver_id,
            record.giver_display_name,
            record.giver_image_url,
            record.ingested_at,
        )
        .await?;
        upsert_actor(
            &mut tx,
            record.requester_id,
            record.requester_display_name,
            record.requester_image_url,
            record.ingested_at,
        )
        .await?;

        let existing = sqlx::query("SELECT id FROM stamp_events WHERE dedupe_key = ?")
            .bind(record.dedupe_key)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = existing {
            tx.commit().await?;
            return Ok(IngestOutcome {
                duplicate: true,
                id: row.get("id"),
            });
        }

        let id = Uuid::new_v4().to_string();
        let occurred_at = record.occurred_at.unwrap_or(record.ingested_at);
        let source = match record.source {
            Some(source) => source.to_string(),
            None => stamp_source(record.reaction),
        };
        let insert = sqlx::query(
            "INSERT INTO stamp_events \
             (id, giver_id, requester_id, stamp_count, occurred_at, source, channel_id, pr_url, dedupe_key) \
             VALUES (?, ?, ?, 1, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(record.giver_id)
        .bind(record.requester_id)
        .bind(to_rfc3339(occurred_at))
        .bind(&source)
        .bind(record.channel_id)
        .bind(record.pr_url)
        .bind(record.dedupe_key)
        .execute(&mut *tx)
        .await;

        match insert {
            Ok(_) => {
                tx.commit().await?;
                Ok(IngestOutcome {
                    duplicate: false,
                    id,
                })
            }
            Err(err) if is_unique_violation(&err) => {
                let row = sqlx::query("SELECT id FROM stamp_events WHERE dedupe_key = ?")
                    .bind(record.dedupe_key)
                    .fetch_one(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(IngestOutcome {
                    duplicate: true,
                    id: row.get("id"),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Removes the stamp matching `dedupe_key`, falling back to a scan over
    /// `(giver, requester, channel, source)` when no keyed row exists.
    ///
    /// The fallback covers rows created before dedupe keys were recorded and
    /// reorderings where a removal outruns the add it pairs with.
    pub async fn remove(&self, args: RemoveStamp<'_>) -> Result<RemoveOutcome, StorageError> {
        let result = sqlx::query("DELETE FROM stamp_events WHERE dedupe_key = ?")
            .bind(args.dedupe_key)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(RemoveOutcome {
                removed: result.rows_affected(),
                strategy: RemoveStrategy::Exact,
            });
        }

        let source = match args.source {
            Some(source) => source.to_string(),
            None => stamp_source(args.reaction),
        };
        let result = sqlx::query(
            "DELETE FROM stamp_events \
             WHERE giver_id = ? AND requester_id = ? AND channel_id = ? AND source = ?",
        )
        .bind(args.giver_id)
        .bind(args.requester_id)
        .bind(args.channel_id)
        .bind(&source)
        .execute(&self.pool)
        .await?;

        Ok(RemoveOutcome {
            removed: result.rows_affected(),
            strategy: RemoveStrategy::Fallback,
        })
    }

    /// Lists stamp events, optionally bounded to those at or after `since`.
    pub async fn list_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StampEventRow>, StorageError> {
        let rows = match since {
            Some(since) => {
                sqlx::query_as::<_, StampEventRow>(
                    "SELECT id, giver_id, requester_id, stamp_count, occurred_at, source, channel_id, pr_url, dedupe_key \
                     FROM stamp_events WHERE occurred_at >= ? ORDER BY occurred_at ASC",
                )
                .bind(to_rfc3339(since))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, StampEventRow>(
                    "SELECT id, giver_id, requester_id, stamp_count, occurred_at, source, channel_id, pr_url, dedupe_key \
                     FROM stamp_events ORDER BY occurred_at ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// Lists the most recent stamp events, newest first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<StampEventRow>, StorageError> {
        let rows = sqlx::query_as::<_, StampEventRow>(
            "SELECT id, giver_id, requester_id, stamp_count, occurred_at, source, channel_id, pr_url, dedupe_key \
             FROM stamp_events ORDER BY occurred_at DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Deletes stamp events older than `cutoff`, returning the number removed.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM stamp_events WHERE occurred_at < ?")
            .bind(to_rfc3339(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Counts stored stamp events.
    pub async fn count(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stamp_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

/// Data required to ingest a stamp event.
#[derive(Debug, Clone)]
pub struct NewStampEvent<'a> {
    pub giver_id: &'a str,
    pub requester_id: &'a str,
    pub giver_display_name: Option<&'a str>,
    pub giver_image_url: Option<&'a str>,
    pub requester_display_name: Option<&'a str>,
    pub requester_image_url: Option<&'a str>,
    pub reaction: &'a str,
    pub source: Option<&'a str>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
    pub channel_id: &'a str,
    pub pr_url: Option<&'a str>,
    pub dedupe_key: &'a str,
}

/// Arguments for removing a stamp.
#[derive(Debug, Clone)]
pub struct RemoveStamp<'a> {
    pub dedupe_key: &'a str,
    pub giver_id: &'a str,
    pub requester_id: &'a str,
    pub reaction: &'a str,
    pub source: Option<&'a str>,
    pub channel_id: &'a str,
}

/// Outcome of a stamp removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub removed: u64,
    pub strategy: RemoveStrategy,
}

/// Which matching strategy a removal used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStrategy {
    Exact,
    Fallback,
}

impl RemoveStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fallback => "fallback",
        }
    }
}

/// Stored stamp event row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StampEventRow {
    pub id: String,
    pub giver_id: String,
    pub requester_id: String,
    pub stamp_count: i64,
    pub occurred_at: DateTime<Utc>,
    pub source: String,
    pub channel_id: Option<String>,
    pub pr_url: Option<String>,
    pub dedupe_key: Option<String>,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some(SQLITE_UNIQUE_VIOLATION)
        }
        _ => false,
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
