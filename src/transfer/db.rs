//! Transfer Database Layer
//!
//! SQLite-backed record store. Summary records and their parts live as flat
//! rows in one table so a single scan can rebuild any multipart group.
//! Every write is one statement or one transaction; state changes that must
//! not race use compare-and-swap (`WHERE state = ?`).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Executor, Row, Sqlite};
use tracing::warn;

use super::channel::TransferCommand;
use super::error::TransferError;
use super::state::TransferState;
use super::types::{Metadata, NewTransfer, TransferId, TransferRecord, TransferType};

/// Idempotent schema, applied on every open
const SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS transfers (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        main_upload_id  INTEGER,
        transfer_type   INTEGER NOT NULL,
        state           INTEGER NOT NULL,
        bucket          TEXT    NOT NULL,
        object_key      TEXT    NOT NULL,
        file_path       TEXT    NOT NULL,
        file_offset     INTEGER NOT NULL DEFAULT 0,
        bytes_total     INTEGER NOT NULL DEFAULT 0,
        bytes_current   INTEGER NOT NULL DEFAULT 0,
        part_num        INTEGER NOT NULL DEFAULT 0,
        is_last_part    INTEGER NOT NULL DEFAULT 0,
        is_multipart    INTEGER NOT NULL DEFAULT 0,
        multipart_id    TEXT,
        etag            TEXT,
        metadata        TEXT    NOT NULL DEFAULT '{}',
        error_message   TEXT,
        created_at      TEXT    NOT NULL,
        updated_at      TEXT    NOT NULL,
        CHECK (bytes_current >= 0 AND bytes_current <= bytes_total)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transfers_main_upload ON transfers (main_upload_id)",
    "CREATE INDEX IF NOT EXISTS idx_transfers_type_state ON transfers (transfer_type, state)",
    r#"
    CREATE TABLE IF NOT EXISTS transfer_commands (
        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
        transfer_id     INTEGER NOT NULL,
        command         INTEGER NOT NULL,
        queued_at       TEXT    NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS worker_lease (
        name            TEXT    PRIMARY KEY,
        holder          TEXT    NOT NULL,
        expires_at_ms   INTEGER NOT NULL
    )
    "#,
];

/// `SELECT <all columns> FROM transfers <tail>`
macro_rules! select_records {
    ($tail:literal) => {
        concat!(
            "SELECT id, main_upload_id, transfer_type, state, bucket, object_key, file_path, ",
            "file_offset, bytes_total, bytes_current, part_num, is_last_part, is_multipart, ",
            "multipart_id, etag, metadata, error_message, created_at, updated_at ",
            "FROM transfers ",
            $tail
        )
    };
}

const SQL_INSERT: &str = r#"
    INSERT INTO transfers
        (main_upload_id, transfer_type, state, bucket, object_key, file_path, file_offset,
         bytes_total, bytes_current, part_num, is_last_part, is_multipart, metadata,
         created_at, updated_at)
    VALUES
        (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?)
"#;

/// Row selection for [`TransferDb::scan`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFilter {
    /// Single and summary records of a direction (parts excluded)
    Type(TransferType),
    /// Single and summary records of a direction in one state (parts excluded)
    TypeAndState(TransferType, TransferState),
    /// Every row in a state, parts included
    State(TransferState),
    /// Parts of one summary, in part order
    Parts(TransferId),
}

/// Transfer database operations
#[derive(Clone)]
pub struct TransferDb {
    pool: SqlitePool,
}

impl TransferDb {
    /// Wrap an existing pool. Call [`init_schema`](Self::init_schema) before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) a database file and apply the schema
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, TransferError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let db = Self::new(pool);
        db.init_schema().await?;
        Ok(db)
    }

    /// Private in-memory database on a single long-lived connection
    pub async fn in_memory() -> Result<Self, TransferError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Self::new(pool);
        db.init_schema().await?;
        Ok(db)
    }

    /// Create the table and indexes if missing
    pub async fn init_schema(&self) -> Result<(), TransferError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Inserts
    // ========================================================================

    /// Insert one WAITING record and return its id
    pub async fn insert_single(&self, record: &NewTransfer) -> Result<TransferId, TransferError> {
        insert_row(&self.pool, record, None).await
    }

    /// Insert a summary and its parts in one transaction
    ///
    /// Returns `[summary_id, part ids...]`. Nothing is written if any insert
    /// fails or the parts do not add up to the summary.
    pub async fn insert_multipart(
        &self,
        summary: &NewTransfer,
        parts: &[NewTransfer],
    ) -> Result<Vec<TransferId>, TransferError> {
        let parts_total: u64 = parts.iter().map(|p| p.bytes_total).sum();
        if parts.is_empty() || parts_total != summary.bytes_total {
            return Err(TransferError::InvalidInput(format!(
                "parts cover {} bytes, summary declares {}",
                parts_total, summary.bytes_total
            )));
        }
        if parts.iter().filter(|p| p.is_last_part).count() != 1 {
            return Err(TransferError::InvalidInput(
                "exactly one part must be flagged last".to_string(),
            ));
        }
        if parts.iter().any(|p| p.part_num == 0) {
            return Err(TransferError::InvalidInput(
                "part numbers start at 1".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let summary_id = insert_row(&mut *tx, summary, None).await?;

        let mut ids = Vec::with_capacity(parts.len() + 1);
        ids.push(summary_id);
        for part in parts {
            ids.push(insert_row(&mut *tx, part, Some(summary_id)).await?);
        }
        tx.commit().await?;

        Ok(ids)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Get a record by id
    pub async fn get(&self, id: TransferId) -> Result<Option<TransferRecord>, TransferError> {
        let row = sqlx::query(select_records!("WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Lazily stream the rows matching `filter`
    ///
    /// The connection is held only while the stream is alive and is returned
    /// to the pool when it is dropped, exhausted, or yields an error. Calling
    /// `scan` again restarts from the first row.
    pub fn scan(&self, filter: RecordFilter) -> BoxStream<'_, Result<TransferRecord, TransferError>> {
        let query = match filter {
            RecordFilter::Type(transfer_type) => {
                sqlx::query(select_records!(
                    "WHERE transfer_type = ? AND part_num = 0 ORDER BY id"
                ))
                .bind(transfer_type.id())
            }
            RecordFilter::TypeAndState(transfer_type, state) => {
                sqlx::query(select_records!(
                    "WHERE transfer_type = ? AND state = ? AND part_num = 0 ORDER BY id"
                ))
                .bind(transfer_type.id())
                .bind(state.id())
            }
            RecordFilter::State(state) => {
                sqlx::query(select_records!("WHERE state = ? ORDER BY id")).bind(state.id())
            }
            RecordFilter::Parts(summary_id) => {
                sqlx::query(select_records!(
                    "WHERE main_upload_id = ? ORDER BY part_num"
                ))
                .bind(summary_id)
            }
        };

        query
            .fetch(&self.pool)
            .map(|row| row.map_err(TransferError::from).and_then(|r| row_to_record(&r)))
            .boxed()
    }

    /// Single and summary records of a direction, any state
    pub async fn query_by_type(
        &self,
        transfer_type: TransferType,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        self.scan(RecordFilter::Type(transfer_type))
            .try_collect()
            .await
    }

    /// Single and summary records of a direction in one state
    pub async fn query_by_type_and_state(
        &self,
        transfer_type: TransferType,
        state: TransferState,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        self.scan(RecordFilter::TypeAndState(transfer_type, state))
            .try_collect()
            .await
    }

    /// Parts of a multipart upload ordered by part number
    pub async fn get_parts(
        &self,
        summary_id: TransferId,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        self.scan(RecordFilter::Parts(summary_id))
            .try_collect()
            .await
    }

    /// Every row (parts included) in any of `states`
    pub async fn find_by_states(
        &self,
        states: &[TransferState],
    ) -> Result<Vec<TransferRecord>, TransferError> {
        let mut records = Vec::new();
        for state in states {
            let mut rows = self.scan(RecordFilter::State(*state));
            while let Some(record) = rows.try_next().await? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    // ========================================================================
    // State updates
    // ========================================================================

    /// Unconditional state write
    ///
    /// Returns false if the record does not exist.
    pub async fn update_state(
        &self,
        id: TransferId,
        new_state: TransferState,
    ) -> Result<bool, TransferError> {
        let result = sqlx::query("UPDATE transfers SET state = ?, updated_at = ? WHERE id = ?")
            .bind(new_state.id())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomic CAS update: Update state only if current state matches expected
    ///
    /// Returns true if update succeeded, false if state didn't match
    pub async fn update_state_if(
        &self,
        id: TransferId,
        expected_state: TransferState,
        new_state: TransferState,
    ) -> Result<bool, TransferError> {
        let result = sqlx::query(
            "UPDATE transfers SET state = ?, updated_at = ? WHERE id = ? AND state = ?",
        )
        .bind(new_state.id())
        .bind(Utc::now())
        .bind(id)
        .bind(expected_state.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// State write carrying a failure message
    pub async fn update_state_with_error(
        &self,
        id: TransferId,
        new_state: TransferState,
        error: &str,
    ) -> Result<bool, TransferError> {
        let result = sqlx::query(
            "UPDATE transfers SET state = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(new_state.id())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// CAS back to WAITING, clearing the last error
    pub async fn mark_waiting_if(
        &self,
        id: TransferId,
        expected_state: TransferState,
    ) -> Result<bool, TransferError> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET state = ?, error_message = NULL, updated_at = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(TransferState::Waiting.id())
        .bind(Utc::now())
        .bind(id)
        .bind(expected_state.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move every part of a summary that is in one of `from` to `to`
    ///
    /// Returns the number of parts changed.
    pub async fn update_group_state(
        &self,
        summary_id: TransferId,
        from: &[TransferState],
        to: TransferState,
    ) -> Result<u64, TransferError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;
        for state in from {
            let result = sqlx::query(
                r#"
                UPDATE transfers SET state = ?, updated_at = ?
                WHERE main_upload_id = ? AND state = ?
                "#,
            )
            .bind(to.id())
            .bind(now)
            .bind(summary_id)
            .bind(state.id())
            .execute(&mut *tx)
            .await?;
            changed += result.rows_affected();
        }
        tx.commit().await?;

        Ok(changed)
    }

    // ========================================================================
    // Progress updates
    // ========================================================================

    /// Advance `bytes_current`, optionally recording an eTag
    ///
    /// The write is refused (returns false) if it would move progress
    /// backwards or past `bytes_total`.
    pub async fn update_progress(
        &self,
        id: TransferId,
        bytes_current: u64,
        etag: Option<&str>,
    ) -> Result<bool, TransferError> {
        let bytes = bytes_current as i64;
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET bytes_current = ?, etag = COALESCE(?, etag), updated_at = ?
            WHERE id = ? AND ? >= bytes_current AND ? <= bytes_total
            "#,
        )
        .bind(bytes)
        .bind(etag)
        .bind(Utc::now())
        .bind(id)
        .bind(bytes)
        .bind(bytes)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record the object length learned from the remote store
    pub async fn set_bytes_total(
        &self,
        id: TransferId,
        bytes_total: u64,
    ) -> Result<bool, TransferError> {
        let total = bytes_total as i64;
        let result = sqlx::query(
            r#"
            UPDATE transfers SET bytes_total = ?, updated_at = ?
            WHERE id = ? AND bytes_current <= ?
            "#,
        )
        .bind(total)
        .bind(Utc::now())
        .bind(id)
        .bind(total)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark a part COMPLETED with its remote eTag
    pub async fn complete_part(&self, id: TransferId, etag: &str) -> Result<bool, TransferError> {
        if etag.trim().is_empty() {
            return Err(TransferError::InvalidInput(format!(
                "part {} cannot complete without an eTag",
                id
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET state = ?, etag = ?, bytes_current = bytes_total, error_message = NULL,
                updated_at = ?
            WHERE id = ? AND part_num > 0
            "#,
        )
        .bind(TransferState::Completed.id())
        .bind(etag)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Summary `bytes_current` := sum of its parts' progress
    ///
    /// Returns the summary's new `(bytes_current, bytes_total)`.
    pub async fn refresh_summary_progress(
        &self,
        summary_id: TransferId,
    ) -> Result<Option<(u64, u64)>, TransferError> {
        sqlx::query(
            r#"
            UPDATE transfers
            SET bytes_current = (
                    SELECT COALESCE(SUM(p.bytes_current), 0)
                    FROM transfers p
                    WHERE p.main_upload_id = ?
                ),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(summary_id)
        .bind(Utc::now())
        .bind(summary_id)
        .execute(&self.pool)
        .await?;

        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT bytes_current, bytes_total FROM transfers WHERE id = ?")
                .bind(summary_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(current, total)| (current as u64, total as u64)))
    }

    /// Restart one part from byte 0
    pub async fn reset_part(&self, id: TransferId) -> Result<bool, TransferError> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET state = ?, bytes_current = 0, etag = NULL, error_message = NULL, updated_at = ?
            WHERE id = ? AND part_num > 0
            "#,
        )
        .bind(TransferState::Waiting.id())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reset a record and its parts for a full restart
    ///
    /// Only applies while the record is still in `expected_state`. Clears
    /// progress, eTags, the multipart upload id and the last error, and
    /// leaves every row WAITING. Returns false if the state did not match.
    pub async fn reset_for_restart(
        &self,
        id: TransferId,
        expected_state: TransferState,
    ) -> Result<bool, TransferError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE transfers
            SET state = ?, bytes_current = 0, etag = NULL, multipart_id = NULL,
                error_message = NULL, updated_at = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(TransferState::Waiting.id())
        .bind(now)
        .bind(id)
        .bind(expected_state.id())
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE transfers
            SET state = ?, bytes_current = 0, etag = NULL, multipart_id = NULL,
                error_message = NULL, updated_at = ?
            WHERE main_upload_id = ?
            "#,
        )
        .bind(TransferState::Waiting.id())
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Truncate recorded progress, e.g. after the local file turned out shorter
    pub async fn rewind_progress(
        &self,
        id: TransferId,
        bytes_current: u64,
    ) -> Result<bool, TransferError> {
        let bytes = bytes_current as i64;
        let result = sqlx::query(
            r#"
            UPDATE transfers SET bytes_current = ?, updated_at = ?
            WHERE id = ? AND bytes_current >= ?
            "#,
        )
        .bind(bytes)
        .bind(Utc::now())
        .bind(id)
        .bind(bytes)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Store (or clear) the multipart upload id on a summary and all its parts
    pub async fn set_multipart_id(
        &self,
        summary_id: TransferId,
        upload_id: Option<&str>,
    ) -> Result<u64, TransferError> {
        let result = sqlx::query(
            r#"
            UPDATE transfers SET multipart_id = ?, updated_at = ?
            WHERE id = ? OR main_upload_id = ?
            "#,
        )
        .bind(upload_id)
        .bind(Utc::now())
        .bind(summary_id)
        .bind(summary_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Delete a record and, for a summary, all of its parts
    ///
    /// Drops any command still queued for it. Returns the number of
    /// transfer rows removed.
    pub async fn delete(&self, id: TransferId) -> Result<u64, TransferError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM transfers WHERE id = ? OR main_upload_id = ?")
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM transfer_commands WHERE transfer_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    // ========================================================================
    // Queued commands
    // ========================================================================

    /// Park a command for whichever worker holds the lease
    pub async fn queue_command(&self, command: TransferCommand) -> Result<(), TransferError> {
        sqlx::query("INSERT INTO transfer_commands (transfer_id, command, queued_at) VALUES (?, ?, ?)")
            .bind(command.id())
            .bind(command.code())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Remove and return every queued command in the order it was queued
    pub async fn take_queued_commands(&self) -> Result<Vec<TransferCommand>, TransferError> {
        let mut rows: Vec<(i64, i64, i64)> =
            sqlx::query_as("DELETE FROM transfer_commands RETURNING seq, transfer_id, command")
                .fetch_all(&self.pool)
                .await?;
        rows.sort_by_key(|(seq, _, _)| *seq);

        Ok(rows
            .into_iter()
            .filter_map(|(seq, id, code)| {
                let command = i16::try_from(code)
                    .ok()
                    .and_then(|code| TransferCommand::from_code(code, id));
                if command.is_none() {
                    warn!(seq, transfer_id = id, code, "Unknown queued command dropped");
                }
                command
            })
            .collect())
    }

    // ========================================================================
    // Worker lease
    // ========================================================================

    /// Claim or extend lease `name` for `holder` until now + `ttl`
    ///
    /// Succeeds when the lease is free, expired, or already `holder`'s.
    pub async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, TransferError> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        let result = sqlx::query(
            r#"
            INSERT INTO worker_lease (name, holder, expires_at_ms) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE
                SET holder = excluded.holder, expires_at_ms = excluded.expires_at_ms
                WHERE worker_lease.holder = excluded.holder OR worker_lease.expires_at_ms <= ?
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Push the expiry of a lease `holder` still owns; false once it is lost
    pub async fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, TransferError> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        let result = sqlx::query(
            "UPDATE worker_lease SET expires_at_ms = ? WHERE name = ? AND holder = ?",
        )
        .bind(expires_at)
        .bind(name)
        .bind(holder)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn release_lease(&self, name: &str, holder: &str) -> Result<bool, TransferError> {
        let result = sqlx::query("DELETE FROM worker_lease WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Current unexpired holder of lease `name`
    pub async fn lease_holder(&self, name: &str) -> Result<Option<String>, TransferError> {
        let holder: Option<(String,)> = sqlx::query_as(
            "SELECT holder FROM worker_lease WHERE name = ? AND expires_at_ms > ?",
        )
        .bind(name)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(holder.map(|(holder,)| holder))
    }

    /// Underlying pool, for callers sharing the database file
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn insert_row<'e, E>(
    executor: E,
    record: &NewTransfer,
    main_upload_id: Option<TransferId>,
) -> Result<TransferId, TransferError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = Utc::now();
    let metadata = serde_json::to_string(&record.metadata)?;

    let result = sqlx::query(SQL_INSERT)
        .bind(main_upload_id)
        .bind(record.transfer_type.id())
        .bind(TransferState::Waiting.id())
        .bind(record.bucket.as_str())
        .bind(record.key.as_str())
        .bind(record.file_path.to_string_lossy().into_owned())
        .bind(record.file_offset as i64)
        .bind(record.bytes_total as i64)
        .bind(i64::from(record.part_num))
        .bind(record.is_last_part)
        .bind(record.is_multipart)
        .bind(metadata)
        .bind(now)
        .bind(now)
        .execute(executor)
        .await?;

    Ok(result.last_insert_rowid())
}

/// Convert database row to TransferRecord
fn row_to_record(row: &SqliteRow) -> Result<TransferRecord, TransferError> {
    let id: i64 = row.try_get("id")?;

    let state_id: i64 = row.try_get("state")?;
    let state = i16::try_from(state_id)
        .ok()
        .and_then(TransferState::from_id)
        .ok_or_else(|| {
            TransferError::DatabaseError(format!("Invalid state ID {} on record {}", state_id, id))
        })?;

    let type_id: i64 = row.try_get("transfer_type")?;
    let transfer_type = i16::try_from(type_id)
        .ok()
        .and_then(TransferType::from_id)
        .ok_or_else(|| {
            TransferError::DatabaseError(format!(
                "Invalid transfer_type {} on record {}",
                type_id, id
            ))
        })?;

    let metadata_json: String = row.try_get("metadata")?;
    let metadata: Metadata = serde_json::from_str(&metadata_json)?;

    let file_path: String = row.try_get("file_path")?;
    let part_num: i64 = row.try_get("part_num")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(TransferRecord {
        id,
        main_upload_id: row.try_get("main_upload_id")?,
        transfer_type,
        state,
        bucket: row.try_get("bucket")?,
        key: row.try_get("object_key")?,
        file_path: PathBuf::from(file_path),
        file_offset: row.try_get::<i64, _>("file_offset")? as u64,
        bytes_total: row.try_get::<i64, _>("bytes_total")? as u64,
        bytes_current: row.try_get::<i64, _>("bytes_current")? as u64,
        part_num: u32::try_from(part_num).unwrap_or_default(),
        is_last_part: row.try_get("is_last_part")?,
        is_multipart: row.try_get("is_multipart")?,
        multipart_id: row.try_get("multipart_id")?,
        etag: row.try_get("etag")?,
        metadata,
        error: row.try_get("error_message")?,
        created_at,
        updated_at,
    })
}
