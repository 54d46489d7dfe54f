//! Persistence boundary: deduplicated inserts and the per-item submission
//! status machine (`New` → `Submitted` | `Error`).
//!
//! Every logical operation opens a fresh connection and closes it before
//! returning; nothing here is shared between pipeline stages.

use async_trait::async_trait;
use rsnw_core::{CleanedRecord, ItemStatus, NewsItem};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Connection, Row};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "rsnw-storage";

pub mod testing;

pub const DEFAULT_FAIL_THRESHOLD: u32 = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("news item {0} not found")]
    NotFound(i64),
    #[error("unknown status code {code:?} on news item {id}")]
    UnknownStatus { id: i64, code: String },
}

/// Connection settings, environment-driven with the deployment defaults.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Consecutive failures after which an item escalates to `Error`.
    pub fail_threshold: u32,
}

impl DbConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("DB_HOST").unwrap_or_else(|_| "mysql-db".to_string()),
            port: std::env::var("DB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3306),
            user: std::env::var("DB_USER").unwrap_or_else(|_| "scraper_user".to_string()),
            password: std::env::var("DB_PASSWORD").unwrap_or_else(|_| "scraper_password".to_string()),
            database: std::env::var("DB_NAME").unwrap_or_else(|_| "security_news".to_string()),
            fail_threshold: std::env::var("RSNW_FAIL_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_FAIL_THRESHOLD),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub fail_count: u32,
    /// True when the item is now in the terminal `Error` state.
    pub escalated: bool,
}

/// Result of the `check-db` diagnostic.
#[derive(Debug, Clone, Copy)]
pub struct ProbeReport {
    pub inserted: bool,
    pub readback: bool,
}

/// Persistence operations the pipelines depend on. `MySqlStore` is the real
/// implementation; `testing::MemoryStore` mirrors the same semantics for
/// deterministic tests.
#[async_trait]
pub trait NewsStore: Send + Sync {
    /// Deduplicated batch insert; returns the number of rows actually
    /// inserted. Duplicate (title, url) pairs are silently absorbed. A
    /// connectivity failure rolls the whole batch back.
    async fn insert(&self, batch: &[CleanedRecord]) -> Result<usize, StoreError>;

    /// All `New` items, oldest publish date first, insertion order as the
    /// tie-break.
    async fn pending(&self) -> Result<Vec<NewsItem>, StoreError>;

    /// Transition to `Submitted`. Idempotent; a no-op on `Error`.
    async fn mark_submitted(&self, id: i64) -> Result<(), StoreError>;

    /// Increment the failure count and, atomically with the increment,
    /// escalate to `Error` when the threshold is reached. A no-op on
    /// terminal states.
    async fn record_failure(&self, id: i64) -> Result<FailureOutcome, StoreError>;
}

const CREATE_TABLE_SQL: &str = "\
CREATE TABLE IF NOT EXISTS news (
  id BIGINT NOT NULL AUTO_INCREMENT,
  title VARCHAR(512) NOT NULL,
  url VARCHAR(1024) NOT NULL,
  publish_date DATE NOT NULL,
  source VARCHAR(128) NOT NULL,
  description TEXT NOT NULL,
  status CHAR(1) NOT NULL DEFAULT 'N',
  fail_count INT UNSIGNED NOT NULL DEFAULT 0,
  PRIMARY KEY (id),
  UNIQUE KEY uq_news_title_url (title(191), url(191))
) DEFAULT CHARSET = utf8mb4";

const INSERT_SQL: &str = "\
INSERT IGNORE INTO news (title, url, publish_date, source, description, status, fail_count) \
VALUES (?, ?, ?, ?, ?, 'N', 0)";

const PENDING_SQL: &str = "\
SELECT id, title, url, publish_date, source, description, status, fail_count \
FROM news WHERE status = 'N' ORDER BY publish_date ASC, id ASC";

const MARK_SUBMITTED_SQL: &str = "UPDATE news SET status = 'Y' WHERE id = ? AND status <> 'E'";

// MySQL applies SET clauses left to right, so the status assignment sees the
// already-incremented fail_count; increment and escalation stay atomic.
const RECORD_FAILURE_SQL: &str = "\
UPDATE news SET fail_count = fail_count + 1, status = IF(fail_count >= ?, 'E', status) \
WHERE id = ? AND status = 'N'";

pub struct MySqlStore {
    options: MySqlConnectOptions,
    fail_threshold: u32,
}

impl MySqlStore {
    pub fn new(config: &DbConfig) -> Self {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);
        Self {
            options,
            fail_threshold: config.fail_threshold.max(1),
        }
    }

    async fn connect(&self) -> Result<MySqlConnection, StoreError> {
        Ok(MySqlConnection::connect_with(&self.options).await?)
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.connect().await?;
        sqlx::query(CREATE_TABLE_SQL).execute(&mut conn).await?;
        conn.close().await?;
        Ok(())
    }

    /// Connectivity diagnostic: insert a fixed probe row and read it back.
    pub async fn probe(&self) -> Result<ProbeReport, StoreError> {
        let mut conn = self.connect().await?;
        let inserted = sqlx::query(INSERT_SQL)
            .bind("System Check: Database Connection Test")
            .bind("http://test.invalid/probe")
            .bind("2029-01-01")
            .bind("System")
            .bind("Probe row")
            .execute(&mut conn)
            .await?
            .rows_affected()
            > 0;
        let readback = sqlx::query("SELECT id FROM news WHERE url = ?")
            .bind("http://test.invalid/probe")
            .fetch_optional(&mut conn)
            .await?
            .is_some();
        conn.close().await?;
        Ok(ProbeReport { inserted, readback })
    }
}

fn row_to_item(row: &MySqlRow) -> Result<NewsItem, StoreError> {
    let id: i64 = row.try_get("id")?;
    let code: String = row.try_get("status")?;
    let status = ItemStatus::from_code(&code).ok_or_else(|| StoreError::UnknownStatus {
        id,
        code: code.clone(),
    })?;
    Ok(NewsItem {
        id,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        publish_date: row.try_get("publish_date")?,
        source: row.try_get("source")?,
        description: row.try_get("description")?,
        status,
        fail_count: row.try_get("fail_count")?,
    })
}

#[async_trait]
impl NewsStore for MySqlStore {
    async fn insert(&self, batch: &[CleanedRecord]) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        let mut inserted = 0usize;
        for record in batch {
            let result = sqlx::query(INSERT_SQL)
                .bind(&record.title)
                .bind(&record.url)
                .bind(record.publish_date)
                .bind(&record.source)
                .bind(&record.description)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                inserted += 1;
            } else {
                debug!(title = %record.title, "duplicate (title, url), skipped");
            }
        }
        tx.commit().await?;
        conn.close().await?;
        info!(batch = batch.len(), inserted, "insert batch committed");
        Ok(inserted)
    }

    async fn pending(&self) -> Result<Vec<NewsItem>, StoreError> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query(PENDING_SQL).fetch_all(&mut conn).await?;
        conn.close().await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn mark_submitted(&self, id: i64) -> Result<(), StoreError> {
        let mut conn = self.connect().await?;
        let result = sqlx::query(MARK_SUBMITTED_SQL)
            .bind(id)
            .execute(&mut conn)
            .await?;
        conn.close().await?;
        if result.rows_affected() == 0 {
            debug!(id, "mark_submitted was a no-op");
        } else {
            info!(id, "item marked submitted");
        }
        Ok(())
    }

    async fn record_failure(&self, id: i64) -> Result<FailureOutcome, StoreError> {
        let mut conn = self.connect().await?;
        sqlx::query(RECORD_FAILURE_SQL)
            .bind(self.fail_threshold)
            .bind(id)
            .execute(&mut conn)
            .await?;
        let row = sqlx::query("SELECT fail_count, status FROM news WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut conn)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let fail_count: u32 = row.try_get("fail_count")?;
        let code: String = row.try_get("status")?;
        conn.close().await?;

        let escalated = code == "E";
        if escalated {
            warn!(id, fail_count, "failure threshold reached, item escalated to error");
        } else {
            warn!(id, fail_count, "failure recorded");
        }
        Ok(FailureOutcome {
            fail_count,
            escalated,
        })
    }
}
