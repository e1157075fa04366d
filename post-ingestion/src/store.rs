use crate::types::{PostRecord, ProcessingState, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use interfaces::{PostId, PostSink};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const INSERT_POST: &str = r#"
    INSERT INTO posts (id, source, author, url, text, created_at, processed, ingested_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (id) DO NOTHING
"#;

/// SQLite-backed post table plus per-source watermarks.
///
/// Post ids are globally unique, so a repeated insert is a silent no-op.
/// Watermarks are written in the same transaction as the posts they cover,
/// which keeps both tables consistent after a crash.
pub struct PostStore {
    db: SqlitePool,
}

impl PostStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool_options = if in_memory {
            // Every connection to an in-memory URL is its own database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            if let Some(parent) = options.get_filename().parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(4)
        };

        let db = pool_options.connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&db).await?;

        debug!("Post store ready at {}", database_url);
        Ok(Self { db })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    pub async fn insert_post(&self, record: &PostRecord) -> Result<bool> {
        let result = bind_record(sqlx::query(INSERT_POST), record)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Store `records` and move the watermark of `source` to at least
    /// `watermark`, all or nothing.
    pub async fn store_batch(&self, source: &str, records: &[PostRecord], watermark: PostId) -> Result<Vec<PostId>> {
        let mut tx = self.db.begin().await?;
        let mut stored = Vec::new();

        for record in records {
            let result = bind_record(sqlx::query(INSERT_POST), record)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                stored.push(record.id);
            }
        }

        if watermark > PostId::ZERO {
            write_watermark(&mut tx, source, watermark).await?;
        }

        tx.commit().await?;

        debug!(
            source,
            stored = stored.len(),
            offered = records.len(),
            watermark = %watermark,
            "Committed batch"
        );
        Ok(stored)
    }

    /// Highest id known for `source`, from its stored posts or its watermark
    /// row, whichever is larger. A store holding posts but no watermark row
    /// still yields the right answer.
    pub async fn highest_id(&self, source: &str) -> Result<PostId> {
        let row = sqlx::query(
            r#"
            SELECT MAX(
                COALESCE((SELECT MAX(id) FROM posts WHERE source = ? COLLATE NOCASE), 0),
                COALESCE((SELECT MAX(high_id) FROM source_watermarks WHERE source = ? COLLATE NOCASE), 0)
            ) AS high
            "#,
        )
        .bind(source)
        .bind(source)
        .fetch_one(&self.db)
        .await?;

        Ok(PostId::from_i64(row.try_get::<i64, _>("high")?))
    }

    pub async fn get_post(&self, id: PostId) -> Result<Option<PostRecord>> {
        let row = sqlx::query(
            "SELECT id, source, author, url, text, created_at, processed FROM posts WHERE id = ?",
        )
        .bind(id.as_i64())
        .fetch_optional(&self.db)
        .await?;

        row.map(|r| row_to_record(&r)).transpose()
    }

    /// Newest posts for `source`, or across all sources when `None`.
    pub async fn get_recent_posts(&self, source: Option<&str>, limit: usize) -> Result<Vec<PostRecord>> {
        let rows = if let Some(source) = source {
            sqlx::query(
                "SELECT id, source, author, url, text, created_at, processed FROM posts WHERE source = ? COLLATE NOCASE ORDER BY id DESC LIMIT ?",
            )
            .bind(source)
            .bind(limit as i64)
            .fetch_all(&self.db)
            .await?
        } else {
            sqlx::query(
                "SELECT id, source, author, url, text, created_at, processed FROM posts ORDER BY id DESC LIMIT ?",
            )
            .bind(limit as i64)
            .fetch_all(&self.db)
            .await?
        };

        rows.iter().map(row_to_record).collect()
    }

    pub async fn count_posts(&self, source: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE source = ? COLLATE NOCASE")
            .bind(source)
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }

    pub async fn get_stats(&self) -> Result<HashMap<String, i64>> {
        let mut stats = HashMap::new();

        let total_posts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.db)
            .await?;
        stats.insert("total_posts".to_string(), total_posts);

        let unprocessed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE processed = ?")
            .bind(ProcessingState::Unprocessed.as_str())
            .fetch_one(&self.db)
            .await?;
        stats.insert("unprocessed_posts".to_string(), unprocessed);

        let sources: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT source) FROM posts")
            .fetch_one(&self.db)
            .await?;
        stats.insert("sources".to_string(), sources);

        Ok(stats)
    }

    pub async fn close(&self) {
        self.db.close().await;
        info!("Post store closed");
    }
}

#[async_trait]
impl PostSink for PostStore {
    async fn upsert(&self, record: &PostRecord) -> anyhow::Result<bool> {
        Ok(self.insert_post(record).await?)
    }

    async fn persist_batch(&self, source: &str, records: &[PostRecord], watermark: PostId) -> anyhow::Result<Vec<PostId>> {
        Ok(self.store_batch(source, records, watermark).await?)
    }

    async fn max_id(&self, source: &str) -> anyhow::Result<PostId> {
        Ok(self.highest_id(source).await?)
    }
}

fn bind_record<'q>(
    query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    record: &'q PostRecord,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(record.id.as_i64())
        .bind(record.source.as_str())
        .bind(record.author.as_str())
        .bind(record.url.as_str())
        .bind(record.text.as_str())
        .bind(format_timestamp(record.created_at))
        .bind(record.state.as_str())
        .bind(format_timestamp(Utc::now()))
}

async fn write_watermark(tx: &mut Transaction<'_, Sqlite>, source: &str, watermark: PostId) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO source_watermarks (source, high_id, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT (source) DO UPDATE SET
            high_id = MAX(source_watermarks.high_id, excluded.high_id),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(source)
    .bind(watermark.as_i64())
    .bind(format_timestamp(Utc::now()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn row_to_record(row: &SqliteRow) -> Result<PostRecord> {
    let created_at: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?
        .with_timezone(&Utc);
    let processed: String = row.try_get("processed")?;

    Ok(PostRecord {
        id: PostId::from_i64(row.try_get("id")?),
        source: row.try_get("source")?,
        author: row.try_get("author")?,
        url: row.try_get("url")?,
        text: row.try_get("text")?,
        created_at,
        state: ProcessingState::parse(&processed).unwrap_or_default(),
    })
}
