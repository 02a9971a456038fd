//! SQLite-based state store for asset bookkeeping
//!
//! Every asset version known to civitdl has exactly one row here. Each
//! operation is a single statement or a single transaction, so a crash
//! mid-call leaves the row either fully updated or untouched.

use crate::error::CivitdlError;
use chrono::{DateTime, Utc};
use civitdl_types::{AssetStatus, AssetVersion, StatusCounts};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Result of trying to take ownership of an asset
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The row is now `InProgress` and owned by the caller
    Claimed(AssetVersion),
    /// Someone else holds it, or it is not in a claimable state
    AlreadyClaimed,
}

/// Where a failed attempt left the asset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailOutcome {
    pub status: AssetStatus,
    pub attempts: u32,
}

impl FailOutcome {
    pub fn will_retry(&self) -> bool {
        self.status == AssetStatus::Pending
    }
}

/// Persistent record of every asset version, keyed by id
#[derive(Clone, Debug)]
pub struct StateStore {
    pool: SqlitePool,
    max_attempts: u32,
}

impl StateStore {
    /// Open (or create) the state database
    pub async fn open<P: AsRef<Path>>(db_path: P, max_attempts: u32) -> Result<Self, CivitdlError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS assets (
                id TEXT PRIMARY KEY,
                model_id INTEGER,
                model_name TEXT,
                model_type TEXT,
                filename TEXT NOT NULL,
                download_url TEXT,
                destination TEXT NOT NULL,
                expected_size INTEGER,
                checksum TEXT,
                size INTEGER,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                claimed_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_assets_status ON assets(status);
            CREATE INDEX IF NOT EXISTS idx_assets_destination ON assets(destination);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            max_attempts: max_attempts.max(1),
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Load an asset by id
    pub async fn lookup(&self, id: &str) -> Result<Option<AssetVersion>, CivitdlError> {
        let row = sqlx::query("SELECT * FROM assets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_asset).transpose()
    }

    /// Id of another asset already recorded at `destination`, if any
    pub async fn destination_owner(
        &self,
        destination: &Path,
        except_id: &str,
    ) -> Result<Option<String>, CivitdlError> {
        let row = sqlx::query("SELECT id FROM assets WHERE destination = ? AND id != ? LIMIT 1")
            .bind(destination.to_string_lossy().to_string())
            .bind(except_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<String, _>("id")))
    }

    /// Insert or update a record keyed by id.
    ///
    /// A row currently `InProgress` belongs to a worker and is left untouched;
    /// returns whether the write was applied.
    pub async fn upsert(&self, asset: &AssetVersion) -> Result<bool, CivitdlError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO assets (
                id, model_id, model_name, model_type, filename, download_url,
                destination, expected_size, checksum, size, status, attempts,
                last_error, claimed_by, created_at, updated_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                model_id = excluded.model_id,
                model_name = excluded.model_name,
                model_type = excluded.model_type,
                filename = excluded.filename,
                download_url = excluded.download_url,
                destination = excluded.destination,
                expected_size = excluded.expected_size,
                checksum = excluded.checksum,
                size = excluded.size,
                status = excluded.status,
                attempts = excluded.attempts,
                last_error = excluded.last_error,
                claimed_by = NULL,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at
            WHERE assets.status != 'in_progress'
            "#,
        )
        .bind(&asset.id)
        .bind(asset.model_id.map(|id| id as i64))
        .bind(asset.model_name.as_ref())
        .bind(asset.model_type.as_ref())
        .bind(&asset.filename)
        .bind(asset.download_url.as_ref())
        .bind(asset.destination_path.to_string_lossy().to_string())
        .bind(asset.expected_size.map(|s| s as i64))
        .bind(asset.checksum.as_ref())
        .bind(asset.size.map(|s| s as i64))
        .bind(asset.status.as_str())
        .bind(asset.attempts as i64)
        .bind(asset.last_error.as_ref())
        .bind(asset.created_at.to_rfc3339())
        .bind(&now)
        .bind(asset.completed_at.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically take ownership of a `Pending` asset for `run_id`.
    ///
    /// Exactly one of several concurrent callers wins. An `InProgress` row is
    /// never taken over; rows orphaned by a crash become claimable again
    /// through [`StateStore::reset_orphans`].
    pub async fn claim(&self, id: &str, run_id: Uuid) -> Result<ClaimOutcome, CivitdlError> {
        let row = sqlx::query(
            r#"
            UPDATE assets
            SET status = 'in_progress', claimed_by = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(run_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                debug!("Claimed asset {} for run {}", id, run_id);
                Ok(ClaimOutcome::Claimed(row_to_asset(row)?))
            }
            None => Ok(ClaimOutcome::AlreadyClaimed),
        }
    }

    /// Record a verified, published download.
    ///
    /// Calling it again with identical arguments is a no-op.
    pub async fn complete(
        &self,
        id: &str,
        final_path: &Path,
        checksum: &str,
        size: u64,
    ) -> Result<(), CivitdlError> {
        let now = Utc::now().to_rfc3339();
        let destination = final_path.to_string_lossy().to_string();
        let result = sqlx::query(
            r#"
            UPDATE assets
            SET status = 'completed', destination = ?, checksum = ?, size = ?,
                last_error = NULL, claimed_by = NULL, updated_at = ?, completed_at = ?
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(&destination)
        .bind(checksum)
        .bind(size as i64)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.lookup(id).await? {
            Some(existing)
                if existing.status == AssetStatus::Completed
                    && existing.destination_path == final_path
                    && existing.size == Some(size)
                    && existing
                        .checksum
                        .as_deref()
                        .is_some_and(|c| c.eq_ignore_ascii_case(checksum)) =>
            {
                Ok(())
            }
            Some(existing) => Err(CivitdlError::InvalidState {
                id: id.to_string(),
                message: format!("cannot complete an asset in status {}", existing.status),
            }),
            None => Err(CivitdlError::NotFound(id.to_string())),
        }
    }

    /// Record a failed attempt.
    ///
    /// Retryable failures go back to `Pending` until `max_attempts` is
    /// reached; permanent ones become `Failed` right away with the attempt
    /// budget marked as spent.
    pub async fn fail(
        &self,
        id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, CivitdlError> {
        let max = self.max_attempts as i64;
        let row = sqlx::query(
            r#"
            UPDATE assets
            SET status = CASE
                    WHEN ? = 0 OR attempts + 1 >= ? THEN 'failed'
                    ELSE 'pending'
                END,
                attempts = CASE WHEN ? = 0 THEN MAX(attempts + 1, ?) ELSE attempts + 1 END,
                last_error = ?,
                claimed_by = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'in_progress'
            RETURNING status, attempts
            "#,
        )
        .bind(retryable as i64)
        .bind(max)
        .bind(retryable as i64)
        .bind(max)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(CivitdlError::InvalidState {
                id: id.to_string(),
                message: "cannot fail an asset that is not in progress".to_string(),
            });
        };

        Ok(FailOutcome {
            status: parse_status(row.get::<String, _>("status").as_str()),
            attempts: row.get::<i64, _>("attempts") as u32,
        })
    }

    /// Hand an in-progress asset back without spending an attempt
    pub async fn release(&self, id: &str) -> Result<(), CivitdlError> {
        sqlx::query(
            r#"
            UPDATE assets
            SET status = 'pending', claimed_by = NULL, updated_at = ?
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark an asset as having nothing to download
    pub async fn skip(&self, id: &str, reason: &str) -> Result<(), CivitdlError> {
        sqlx::query(
            r#"
            UPDATE assets
            SET status = 'skipped', last_error = ?, updated_at = ?
            WHERE id = ? AND status != 'in_progress'
            "#,
        )
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Reset every `InProgress` row to `Pending`. Run once per process,
    /// before the first run claims anything.
    pub async fn reset_orphans(&self) -> Result<u64, CivitdlError> {
        let result = sqlx::query(
            r#"
            UPDATE assets
            SET status = 'pending', claimed_by = NULL, updated_at = ?
            WHERE status = 'in_progress'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            info!("Reset {} orphaned in-progress assets to pending", count);
        }
        Ok(count)
    }

    /// Give every permanently failed asset a fresh attempt budget
    pub async fn requeue_failed(&self) -> Result<u64, CivitdlError> {
        let result = sqlx::query(
            r#"
            UPDATE assets
            SET status = 'pending', attempts = 0, updated_at = ?
            WHERE status = 'failed'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// List assets, optionally filtered by status
    pub async fn list(&self, status: Option<AssetStatus>) -> Result<Vec<AssetVersion>, CivitdlError> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM assets WHERE status = ? ORDER BY updated_at DESC")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM assets ORDER BY updated_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(row_to_asset).collect()
    }

    /// Number of rows per status
    pub async fn counts(&self) -> Result<StatusCounts, CivitdlError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM assets GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let n = row.get::<i64, _>("n") as u64;
            match parse_status(row.get::<String, _>("status").as_str()) {
                AssetStatus::Pending => counts.pending = n,
                AssetStatus::InProgress => counts.in_progress = n,
                AssetStatus::Completed => counts.completed = n,
                AssetStatus::Failed => counts.failed = n,
                AssetStatus::Skipped => counts.skipped = n,
            }
        }
        Ok(counts)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_status(s: &str) -> AssetStatus {
    s.parse().unwrap_or(AssetStatus::Pending)
}

/// Convert a database row to an AssetVersion
fn row_to_asset(row: SqliteRow) -> Result<AssetVersion, CivitdlError> {
    let parse_time = |s: String| -> Result<DateTime<Utc>, CivitdlError> {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| CivitdlError::Serialization(e.to_string()))
    };

    Ok(AssetVersion {
        id: row.get("id"),
        model_id: row.get::<Option<i64>, _>("model_id").map(|id| id as u64),
        model_name: row.get("model_name"),
        model_type: row.get("model_type"),
        filename: row.get("filename"),
        download_url: row.get("download_url"),
        destination_path: PathBuf::from(row.get::<String, _>("destination")),
        expected_size: row.get::<Option<i64>, _>("expected_size").map(|s| s as u64),
        checksum: row.get("checksum"),
        size: row.get::<Option<i64>, _>("size").map(|s| s as u64),
        status: parse_status(row.get::<String, _>("status").as_str()),
        attempts: row.get::<i64, _>("attempts") as u32,
        last_error: row.get("last_error"),
        claimed_by: row
            .get::<Option<String>, _>("claimed_by")
            .and_then(|s| Uuid::parse_str(&s).ok()),
        created_at: parse_time(row.get("created_at"))?,
        updated_at: parse_time(row.get("updated_at"))?,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .map(parse_time)
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use civitdl_types::RemoteAsset;
    use tempfile::TempDir;

    async fn open_store(max_attempts: u32) -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("state.db"), max_attempts)
            .await
            .unwrap();
        (dir, store)
    }

    fn asset(id: &str) -> AssetVersion {
        let remote = RemoteAsset {
            id: id.to_string(),
            filename: format!("{}.safetensors", id),
            ..Default::default()
        };
        AssetVersion::from_remote(&remote, PathBuf::from(format!("/dl/{}.safetensors", id)))
    }

    #[tokio::test]
    async fn test_upsert_and_lookup() {
        let (_dir, store) = open_store(3).await;
        assert!(store.lookup("1").await.unwrap().is_none());

        store.upsert(&asset("1")).await.unwrap();
        let loaded = store.lookup("1").await.unwrap().unwrap();
        assert_eq!(loaded.status, AssetStatus::Pending);
        assert_eq!(loaded.filename, "1.safetensors");

        // Same id again updates in place
        let mut changed = asset("1");
        changed.download_url = Some("https://example.com/1".into());
        store.upsert(&changed).await.unwrap();
        assert_eq!(store.counts().await.unwrap().total(), 1);
        assert_eq!(
            store.lookup("1").await.unwrap().unwrap().download_url.as_deref(),
            Some("https://example.com/1")
        );
    }

    #[tokio::test]
    async fn test_upsert_leaves_claimed_rows_alone() {
        let (_dir, store) = open_store(3).await;
        let run = Uuid::new_v4();
        store.upsert(&asset("1")).await.unwrap();
        assert!(matches!(store.claim("1", run).await.unwrap(), ClaimOutcome::Claimed(_)));

        assert!(!store.upsert(&asset("1")).await.unwrap());
        assert_eq!(
            store.lookup("1").await.unwrap().unwrap().status,
            AssetStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_destination_owner_ignores_the_asset_itself() {
        let (_dir, store) = open_store(3).await;
        store.upsert(&asset("1")).await.unwrap();
        let path = Path::new("/dl/1.safetensors");

        assert_eq!(store.destination_owner(path, "1").await.unwrap(), None);
        assert_eq!(
            store.destination_owner(path, "2").await.unwrap().as_deref(),
            Some("1")
        );
        assert_eq!(
            store
                .destination_owner(Path::new("/dl/other.bin"), "2")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_within_a_run() {
        let (_dir, store) = open_store(3).await;
        let run = Uuid::new_v4();
        store.upsert(&asset("1")).await.unwrap();

        let (a, b) = tokio::join!(store.claim("1", run), store.claim("1", run));
        let outcomes = [a.unwrap(), b.unwrap()];
        let winners = outcomes
            .iter()
            .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
            .count();
        assert_eq!(winners, 1);
        assert!(outcomes.contains(&ClaimOutcome::AlreadyClaimed));
    }

    #[tokio::test]
    async fn test_claim_never_takes_over_a_live_claim() {
        let (_dir, store) = open_store(3).await;
        store.upsert(&asset("1")).await.unwrap();
        let owner = Uuid::new_v4();
        store.claim("1", owner).await.unwrap();

        assert_eq!(
            store.claim("1", Uuid::new_v4()).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        assert_eq!(store.claim("1", owner).await.unwrap(), ClaimOutcome::AlreadyClaimed);
        assert_eq!(
            store.lookup("1").await.unwrap().unwrap().claimed_by,
            Some(owner)
        );

        // Only an orphan reset hands the row out again
        store.reset_orphans().await.unwrap();
        let outcome = store.claim("1", Uuid::new_v4()).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)));
    }

    #[tokio::test]
    async fn test_claim_rejects_completed_and_unknown() {
        let (_dir, store) = open_store(3).await;
        let run = Uuid::new_v4();
        assert_eq!(store.claim("missing", run).await.unwrap(), ClaimOutcome::AlreadyClaimed);

        store.upsert(&asset("1")).await.unwrap();
        store.claim("1", run).await.unwrap();
        store
            .complete("1", Path::new("/dl/1.safetensors"), "abc", 10)
            .await
            .unwrap();
        assert_eq!(store.claim("1", run).await.unwrap(), ClaimOutcome::AlreadyClaimed);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let (_dir, store) = open_store(3).await;
        store.upsert(&asset("1")).await.unwrap();
        store.claim("1", Uuid::new_v4()).await.unwrap();

        let path = Path::new("/dl/1.safetensors");
        store.complete("1", path, "abc", 10).await.unwrap();
        let first = store.lookup("1").await.unwrap().unwrap();
        store.complete("1", path, "abc", 10).await.unwrap();
        let second = store.lookup("1").await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(second.status, AssetStatus::Completed);
        assert_eq!(second.size, Some(10));

        // Different metadata for an already completed row is refused
        assert!(store.complete("1", path, "def", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_retries_until_budget_is_spent() {
        let (_dir, store) = open_store(2).await;
        let run = Uuid::new_v4();
        store.upsert(&asset("1")).await.unwrap();

        store.claim("1", run).await.unwrap();
        let first = store.fail("1", "timeout", true).await.unwrap();
        assert_eq!(first.status, AssetStatus::Pending);
        assert_eq!(first.attempts, 1);

        store.claim("1", run).await.unwrap();
        let second = store.fail("1", "timeout again", true).await.unwrap();
        assert_eq!(second.status, AssetStatus::Failed);
        assert_eq!(second.attempts, 2);

        let row = store.lookup("1").await.unwrap().unwrap();
        assert_eq!(row.last_error.as_deref(), Some("timeout again"));
        assert_eq!(store.claim("1", run).await.unwrap(), ClaimOutcome::AlreadyClaimed);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_immediate() {
        let (_dir, store) = open_store(5).await;
        store.upsert(&asset("1")).await.unwrap();
        store.claim("1", Uuid::new_v4()).await.unwrap();

        let outcome = store.fail("1", "404 not found", false).await.unwrap();
        assert_eq!(outcome.status, AssetStatus::Failed);
        assert_eq!(outcome.attempts, 5);
    }

    #[tokio::test]
    async fn test_fail_requires_a_claim() {
        let (_dir, store) = open_store(3).await;
        store.upsert(&asset("1")).await.unwrap();
        assert!(store.fail("1", "boom", true).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_orphans() {
        let (_dir, store) = open_store(3).await;
        for id in ["1", "2", "3"] {
            store.upsert(&asset(id)).await.unwrap();
        }
        store.claim("1", Uuid::new_v4()).await.unwrap();
        store.claim("2", Uuid::new_v4()).await.unwrap();

        assert_eq!(store.reset_orphans().await.unwrap(), 2);
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.in_progress, 0);
    }

    #[tokio::test]
    async fn test_release_does_not_spend_an_attempt() {
        let (_dir, store) = open_store(3).await;
        store.upsert(&asset("1")).await.unwrap();
        store.claim("1", Uuid::new_v4()).await.unwrap();
        store.release("1").await.unwrap();

        let row = store.lookup("1").await.unwrap().unwrap();
        assert_eq!(row.status, AssetStatus::Pending);
        assert_eq!(row.attempts, 0);
        assert!(row.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_requeue_failed_and_list() {
        let (_dir, store) = open_store(1).await;
        store.upsert(&asset("1")).await.unwrap();
        store.upsert(&asset("2")).await.unwrap();
        store.claim("1", Uuid::new_v4()).await.unwrap();
        store.fail("1", "boom", true).await.unwrap();

        let failed = store.list(Some(AssetStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "1");

        assert_eq!(store.requeue_failed().await.unwrap(), 1);
        let row = store.lookup("1").await.unwrap().unwrap();
        assert_eq!(row.status, AssetStatus::Pending);
        assert_eq!(row.attempts, 0);
        assert_eq!(store.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("state.db");
        {
            let store = StateStore::open(&db, 3).await.unwrap();
            store.upsert(&asset("1")).await.unwrap();
            store.claim("1", Uuid::new_v4()).await.unwrap();
            store.close().await;
        }
        let store = StateStore::open(&db, 3).await.unwrap();
        let row = store.lookup("1").await.unwrap().unwrap();
        assert_eq!(row.status, AssetStatus::InProgress);
        store.reset_orphans().await.unwrap();
        assert_eq!(
            store.lookup("1").await.unwrap().unwrap().status,
            AssetStatus::Pending
        );
    }
}
