//! SQLite-backed [`Store`].
//!
//! The connection lives behind a `std::sync::Mutex` and every call runs on
//! tokio's blocking pool, so async callers never block a runtime thread on
//! disk I/O. Counter updates are single `UPDATE ... RETURNING` statements.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{
    Image, ImageStatus, Job, JobStatus, Resource, ResourceStatus, User, ViewingDirection,
    Visibility,
};

use super::Store;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id              TEXT PRIMARY KEY,
    storage_quota   INTEGER NOT NULL DEFAULT 104857600,
    storage_used    INTEGER NOT NULL DEFAULT 0 CHECK(storage_used >= 0),
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS iiif_resources (
    id                  TEXT PRIMARY KEY,
    user_id             TEXT NOT NULL,
    title               TEXT NOT NULL,
    description         TEXT,
    attribution         TEXT,
    license             TEXT,
    metadata            TEXT,
    status              TEXT NOT NULL CHECK(status IN ('processing', 'ready', 'failed')),
    visibility          TEXT NOT NULL DEFAULT 'public' CHECK(visibility IN ('public', 'private')),
    homepage            TEXT,
    viewing_direction   TEXT,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS images (
    id                  TEXT PRIMARY KEY,
    resource_id         TEXT NOT NULL,
    user_id             TEXT NOT NULL,
    original_filename   TEXT NOT NULL,
    file_path           TEXT NOT NULL,
    ptiff_path          TEXT,
    file_size           INTEGER NOT NULL,
    ptiff_size          INTEGER,
    width               INTEGER,
    height              INTEGER,
    order_index         INTEGER NOT NULL,
    status              TEXT NOT NULL CHECK(status IN ('uploaded', 'processing', 'ready', 'failed')),
    job_id              TEXT,
    error_message       TEXT,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL,
    FOREIGN KEY (resource_id) REFERENCES iiif_resources(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS job_status (
    id              TEXT PRIMARY KEY,
    image_id        TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('waiting', 'active', 'completed', 'failed')),
    progress        INTEGER NOT NULL DEFAULT 0,
    error_message   TEXT,
    attempt         INTEGER NOT NULL DEFAULT 1,
    retry_at        INTEGER,
    started_at      INTEGER,
    completed_at    INTEGER,
    created_at      INTEGER NOT NULL,
    FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_resources_user_id ON iiif_resources(user_id);
CREATE INDEX IF NOT EXISTS idx_images_resource_id ON images(resource_id);
CREATE INDEX IF NOT EXISTS idx_images_status ON images(status);
CREATE INDEX IF NOT EXISTS idx_job_status_image_id ON job_status(image_id);
CREATE INDEX IF NOT EXISTS idx_job_status_status ON job_status(status);
";

const IMAGE_COLUMNS: &str = "id, resource_id, user_id, original_filename, file_path, ptiff_path, \
     file_size, ptiff_size, width, height, order_index, status, job_id, error_message";

const JOB_COLUMNS: &str = "id, image_id, status, progress, error_message, started_at, \
     completed_at, created_at, attempt, retry_at";

/// Columns added after the first release, applied to older database files.
const JOB_MIGRATIONS: &[(&str, &str)] = &[
    ("attempt", "INTEGER NOT NULL DEFAULT 1"),
    ("retry_at", "INTEGER"),
];

const RESOURCE_COLUMNS: &str = "id, user_id, title, description, attribution, license, metadata, \
     status, visibility, homepage, viewing_direction";

// =============================================================================
// Column Conversions
// =============================================================================

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

macro_rules! status_sql {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                <$ty>::from_str(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

status_sql!(JobStatus);
status_sql!(ImageStatus);
status_sql!(ResourceStatus);

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn now_millis() -> i64 {
    millis(Utc::now())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn corrupt(table: &'static str, message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(StoreError::CorruptRow {
            table,
            message: message.into(),
        }),
    )
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        storage_quota: row.get::<_, i64>(1)?.max(0) as u64,
        storage_used: row.get::<_, i64>(2)?.max(0) as u64,
    })
}

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<Resource> {
    let visibility: String = row.get(8)?;
    let direction: Option<String> = row.get(10)?;
    Ok(Resource {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        attribution: row.get(4)?,
        license: row.get(5)?,
        metadata: row.get(6)?,
        status: row.get(7)?,
        visibility: Visibility::parse(&visibility)
            .ok_or_else(|| corrupt("iiif_resources", format!("visibility {:?}", visibility)))?,
        homepage: row.get(9)?,
        // Unknown directions are dropped rather than failing the whole row
        viewing_direction: direction.as_deref().and_then(ViewingDirection::parse),
    })
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<Image> {
    Ok(Image {
        id: row.get(0)?,
        resource_id: row.get(1)?,
        user_id: row.get(2)?,
        original_filename: row.get(3)?,
        source_path: PathBuf::from(row.get::<_, String>(4)?),
        output_path: row.get::<_, Option<String>>(5)?.map(PathBuf::from),
        byte_size: row.get::<_, i64>(6)?.max(0) as u64,
        output_size: row.get::<_, Option<i64>>(7)?.map(|v| v.max(0) as u64),
        width: row.get::<_, Option<i64>>(8)?.map(|v| v as u32),
        height: row.get::<_, Option<i64>>(9)?.map(|v| v as u32),
        order_index: row.get(10)?,
        status: row.get(11)?,
        job_id: row.get(12)?,
        error_message: row.get(13)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        image_id: row.get(1)?,
        status: row.get(2)?,
        progress: row.get::<_, i64>(3)?.clamp(0, 100) as u8,
        error: row.get(4)?,
        started_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
        completed_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        created_at: from_millis(row.get(7)?),
        attempt: row.get::<_, i64>(8)?.max(1) as u32,
        retry_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
    })
}

/// Add any missing job columns to a database created by an older build.
fn migrate_jobs(conn: &Connection) -> rusqlite::Result<()> {
    let existing = {
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('job_status')")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    for (column, definition) in JOB_MIGRATIONS {
        if !existing.iter().any(|name| name == column) {
            conn.execute_batch(&format!(
                "ALTER TABLE job_status ADD COLUMN {} {}",
                column, definition
            ))?;
            info!(column, "Added job_status column");
        }
    }
    Ok(())
}

/// Compare-and-set write of an image row. Returns the number of rows changed.
fn write_image(conn: &Connection, i: &Image, expected: ImageStatus) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE images SET ptiff_path = ?1, ptiff_size = ?2, width = ?3, height = ?4,
             status = ?5, job_id = ?6, error_message = ?7, updated_at = ?8
         WHERE id = ?9 AND status = ?10",
        params![
            i.output_path.as_deref().map(path_text),
            i.output_size.map(to_i64),
            i.width.map(i64::from),
            i.height.map(i64::from),
            i.status,
            i.job_id,
            i.error_message,
            now_millis(),
            i.id,
            expected
        ],
    )
}

// =============================================================================
// SqliteStore
// =============================================================================

/// [`Store`] implementation over a single SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!(
                        "cannot create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        info!("Database opened at {}", path.display());
        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        migrate_jobs(&conn)?;
        debug!("Database schema initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("database connection poisoned".into()))?;
            f(&guard).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("database task failed: {}", e)))?
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, storage_quota, storage_used FROM users WHERE id = ?1",
                [&user_id],
                user_from_row,
            )
            .optional()
        })
        .await
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let user = user.clone();
        self.call(move |conn| {
            let now = now_millis();
            conn.execute(
                "INSERT INTO users (id, storage_quota, storage_used, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![
                    user.id,
                    to_i64(user.storage_quota),
                    to_i64(user.storage_used),
                    now
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn increment_storage_used(
        &self,
        user_id: &str,
        bytes: u64,
    ) -> Result<Option<u64>, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            conn.query_row(
                "UPDATE users SET storage_used = storage_used + ?1, updated_at = ?2
                 WHERE id = ?3 RETURNING storage_used",
                params![to_i64(bytes), now_millis(), user_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|used| used.map(|v| v.max(0) as u64))
        })
        .await
    }

    async fn decrement_storage_used(
        &self,
        user_id: &str,
        bytes: u64,
    ) -> Result<Option<u64>, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            conn.query_row(
                "UPDATE users SET storage_used = MAX(0, storage_used - ?1), updated_at = ?2
                 WHERE id = ?3 RETURNING storage_used",
                params![to_i64(bytes), now_millis(), user_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|used| used.map(|v| v.max(0) as u64))
        })
        .await
    }

    async fn get_resource(&self, resource_id: &str) -> Result<Option<Resource>, StoreError> {
        let resource_id = resource_id.to_string();
        self.call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM iiif_resources WHERE id = ?1",
                    RESOURCE_COLUMNS
                ),
                [&resource_id],
                resource_from_row,
            )
            .optional()
        })
        .await
    }

    async fn insert_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        let r = resource.clone();
        self.call(move |conn| {
            let now = now_millis();
            conn.execute(
                "INSERT INTO iiif_resources (id, user_id, title, description, attribution, license,
                     metadata, status, visibility, homepage, viewing_direction, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                params![
                    r.id,
                    r.user_id,
                    r.title,
                    r.description,
                    r.attribution,
                    r.license,
                    r.metadata,
                    r.status,
                    r.visibility.as_str(),
                    r.homepage,
                    r.viewing_direction.map(ViewingDirection::as_str),
                    now
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn set_resource_status(
        &self,
        resource_id: &str,
        status: ResourceStatus,
    ) -> Result<bool, StoreError> {
        let resource_id = resource_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE iiif_resources SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status, now_millis(), resource_id],
            )
            .map(|changed| changed > 0)
        })
        .await
    }

    async fn delete_resource(&self, resource_id: &str) -> Result<Option<Vec<Image>>, StoreError> {
        let resource_id = resource_id.to_string();
        self.call(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let images = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM images WHERE resource_id = ?1 ORDER BY order_index, id",
                    IMAGE_COLUMNS
                ))?;
                let rows = stmt.query_map([&resource_id], image_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let deleted = tx.execute("DELETE FROM iiif_resources WHERE id = ?1", [&resource_id])?;
            tx.commit()?;
            Ok((deleted > 0).then_some(images))
        })
        .await
    }

    async fn get_image(&self, image_id: &str) -> Result<Option<Image>, StoreError> {
        let image_id = image_id.to_string();
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM images WHERE id = ?1", IMAGE_COLUMNS),
                [&image_id],
                image_from_row,
            )
            .optional()
        })
        .await
    }

    async fn insert_image(&self, image: &Image) -> Result<(), StoreError> {
        let i = image.clone();
        self.call(move |conn| {
            let now = now_millis();
            conn.execute(
                &format!(
                    "INSERT INTO images ({}, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
                    IMAGE_COLUMNS
                ),
                params![
                    i.id,
                    i.resource_id,
                    i.user_id,
                    i.original_filename,
                    path_text(&i.source_path),
                    i.output_path.as_deref().map(path_text),
                    to_i64(i.byte_size),
                    i.output_size.map(to_i64),
                    i.width.map(i64::from),
                    i.height.map(i64::from),
                    i.order_index,
                    i.status,
                    i.job_id,
                    i.error_message,
                    now
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn images_for_resource(&self, resource_id: &str) -> Result<Vec<Image>, StoreError> {
        let resource_id = resource_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM images WHERE resource_id = ?1 ORDER BY order_index, id",
                IMAGE_COLUMNS
            ))?;
            let rows = stmt.query_map([&resource_id], image_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn undispatched_images(&self) -> Result<Vec<Image>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM images WHERE status = ?1 AND job_id IS NULL
                 ORDER BY resource_id, order_index, id",
                IMAGE_COLUMNS
            ))?;
            let rows = stmt.query_map([ImageStatus::Uploaded], image_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn update_image(
        &self,
        image: &Image,
        expected: ImageStatus,
    ) -> Result<bool, StoreError> {
        let i = image.clone();
        self.call(move |conn| write_image(conn, &i, expected).map(|changed| changed > 0))
            .await
    }

    async fn mark_ready_and_credit(&self, image: &Image) -> Result<bool, StoreError> {
        let i = image.clone();
        self.call(move |conn| {
            let tx = conn.unchecked_transaction()?;
            if write_image(&tx, &i, ImageStatus::Processing)? == 0 {
                return Ok(false);
            }
            tx.execute(
                "UPDATE users SET storage_used = storage_used + ?1, updated_at = ?2
                 WHERE id = ?3",
                params![to_i64(i.output_size.unwrap_or(0)), now_millis(), i.user_id],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let job_id = job_id.to_string();
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM job_status WHERE id = ?1", JOB_COLUMNS),
                [&job_id],
                job_from_row,
            )
            .optional()
        })
        .await
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let j = job.clone();
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO job_status ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    JOB_COLUMNS
                ),
                params![
                    j.id,
                    j.image_id,
                    j.status,
                    i64::from(j.progress),
                    j.error,
                    j.started_at.map(millis),
                    j.completed_at.map(millis),
                    millis(j.created_at),
                    i64::from(j.attempt),
                    j.retry_at.map(millis)
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn update_job(&self, job: &Job) -> Result<bool, StoreError> {
        let j = job.clone();
        self.call(move |conn| {
            conn.execute(
                "UPDATE job_status SET status = ?1, progress = ?2, error_message = ?3,
                     started_at = ?4, completed_at = ?5, attempt = ?6, retry_at = ?7
                 WHERE id = ?8",
                params![
                    j.status,
                    i64::from(j.progress),
                    j.error,
                    j.started_at.map(millis),
                    j.completed_at.map(millis),
                    i64::from(j.attempt),
                    j.retry_at.map(millis),
                    j.id
                ],
            )
            .map(|changed| changed > 0)
        })
        .await
    }

    async fn set_job_progress(&self, job_id: &str, progress: u8) -> Result<bool, StoreError> {
        let job_id = job_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE job_status SET progress = ?1 WHERE id = ?2",
                params![i64::from(progress), job_id],
            )
            .map(|changed| changed > 0)
        })
        .await
    }

    async fn jobs_for_resource(&self, resource_id: &str) -> Result<Vec<Job>, StoreError> {
        let resource_id = resource_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT js.id, js.image_id, js.status, js.progress, js.error_message,
                        js.started_at, js.completed_at, js.created_at, js.attempt, js.retry_at
                 FROM job_status js
                 INNER JOIN images i ON js.image_id = i.id
                 WHERE i.resource_id = ?1
                 ORDER BY js.created_at ASC",
            )?;
            let rows = stmt.query_map([&resource_id], job_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError> {
        let statuses: Vec<JobStatus> = statuses.to_vec();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM job_status ORDER BY created_at ASC",
                JOB_COLUMNS
            ))?;
            let rows = stmt.query_map([], job_from_row)?;
            let mut jobs = Vec::new();
            for job in rows {
                let job = job?;
                if statuses.contains(&job.status) {
                    jobs.push(job);
                }
            }
            Ok(jobs)
        })
        .await
    }
}

// =============================================================================
// Tests
// =============================================================================
