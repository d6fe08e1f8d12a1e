//! Relational complaint store: pooled SQLite access, reader query and lookups.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use grv_core::RawStoreRecord;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

mod batch;

pub const CRATE_NAME: &str = "grv-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const COMPLAINT_SELECT: &str = r#"
    SELECT c.complaint_id,
           c.description,
           c.status,
           c.severity,
           c.institute,
           c.contacts,
           c.suggestions,
           c.created_at,
           d.name AS dept_name,
           u.name AS student_name,
           u.roll_number,
           u.institute AS student_institute
      FROM complaints c
      LEFT JOIN departments d ON d.dept_id = c.dept_id
      LEFT JOIN users u ON u.user_id = c.student_id
"#;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("statement for batch item {index} failed: {source}")]
    Statement {
        index: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("batch transaction exceeded its {0:?} deadline")]
    Timeout(Duration),
    #[error("encoding {field}: {source}")]
    Encode {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub tx_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 5,
            tx_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewStudent {
    pub roll_number: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub institute: Option<String>,
}

/// Explicitly injected handle to the relational store.
///
/// Every read borrows one pooled connection for the duration of a single
/// statement; [`ComplaintStore::apply_batch`] holds one for the whole
/// transaction and always hands it back, commit or not.
#[derive(Debug, Clone)]
pub struct ComplaintStore {
    pool: SqlitePool,
    tx_timeout: Duration,
}

impl ComplaintStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            tx_timeout: StoreConfig::default().tx_timeout,
        }
    }

    pub fn with_tx_timeout(mut self, tx_timeout: Duration) -> Self {
        self.tx_timeout = tx_timeout;
        self
    }

    pub async fn connect(config: &StoreConfig) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .with_context(|| format!("parsing database url {}", config.database_url))?
            .create_if_missing(true)
            .foreign_keys(true);

        // A private in-memory database lives and dies with its single connection.
        let in_memory = config.database_url.contains(":memory:")
            || config.database_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        info!(database_url = %config.database_url, "connected to complaint store");
        Ok(Self::new(pool).with_tx_timeout(config.tx_timeout))
    }

    /// Fresh, migrated in-memory store.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let store = Self::connect(&StoreConfig::default()).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn tx_timeout(&self) -> Duration {
        self.tx_timeout
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("running complaint store migrations")
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// All complaints, newest first, joined with department and submitter.
    pub async fn fetch_complaints(&self) -> Result<Vec<RawStoreRecord>, StorageError> {
        let sql = format!("{COMPLAINT_SELECT} ORDER BY c.created_at DESC, c.complaint_id");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .instrument(info_span!("fetch_complaints"))
            .await?;
        debug!(rows = rows.len(), "fetched complaint rows");
        rows.iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }

    pub async fn find_complaint(
        &self,
        complaint_id: &str,
    ) -> Result<Option<RawStoreRecord>, StorageError> {
        let sql = format!("{COMPLAINT_SELECT} WHERE c.complaint_id = ?");
        let row = sqlx::query(&sql)
            .bind(complaint_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    pub async fn find_department_id(&self, name: &str) -> Result<Option<i64>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        Ok(department_id(&mut conn, name).await?)
    }

    pub async fn upsert_department(
        &self,
        name: &str,
        contact: Option<&str>,
    ) -> Result<i64, StorageError> {
        let dept_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO departments (name, name_key, contact)
            VALUES (?, ?, ?)
            ON CONFLICT(name_key) DO UPDATE SET contact = COALESCE(excluded.contact, departments.contact)
            RETURNING dept_id
            "#,
        )
        .bind(name.trim())
        .bind(department_key(name))
        .bind(contact)
        .fetch_one(&self.pool)
        .await?;
        Ok(dept_id)
    }

    pub async fn upsert_student(&self, student: &NewStudent) -> Result<i64, StorageError> {
        let user_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO users (roll_number, name, email, institute)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(roll_number) DO UPDATE SET
                name = COALESCE(excluded.name, users.name),
                email = COALESCE(excluded.email, users.email),
                institute = COALESCE(excluded.institute, users.institute)
            RETURNING user_id
            "#,
        )
        .bind(student.roll_number.trim())
        .bind(student.name.as_deref())
        .bind(student.email.as_deref())
        .bind(student.institute.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(user_id)
    }
}

/// Lookup key for department names. SQLite's `LOWER` and `NOCASE` only fold
/// ASCII, so folding happens here.
pub fn department_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Case-insensitive exact match on the folded name.
pub(crate) async fn department_id(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT dept_id FROM departments WHERE name_key = ? LIMIT 1")
        .bind(department_key(name))
        .fetch_optional(conn)
        .await
}

pub(crate) async fn student_id(
    conn: &mut SqliteConnection,
    roll_number: &str,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT user_id FROM users WHERE roll_number = ? LIMIT 1")
        .bind(roll_number.trim())
        .fetch_optional(conn)
        .await
}

fn record_from_row(row: &SqliteRow) -> Result<RawStoreRecord, sqlx::Error> {
    Ok(RawStoreRecord {
        complaint_id: row.try_get("complaint_id")?,
        description: row.try_get("description")?,
        status: row.try_get("status")?,
        severity: row.try_get("severity")?,
        institute: row.try_get("institute")?,
        contacts: row.try_get("contacts")?,
        suggestions: row.try_get("suggestions")?,
        created_at: row.try_get("created_at")?,
        dept_name: row.try_get("dept_name")?,
        student_name: row.try_get("student_name")?,
        roll_number: row.try_get("roll_number")?,
        student_institute: row.try_get("student_institute")?,
    })
}
