//! Article store seam plus PostgreSQL and in-memory implementations.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsharvest_core::{
    ArticleId, Classification, CrawlStatus, CrawlTarget, CrawledContent, NewArticle,
    PendingArticle, UnknownStatus,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Connection, Postgres, Row};
use thiserror::Error;
use tracing::{debug, warn};

mod memory;

pub use memory::MemoryArticleStore;

pub const CRATE_NAME: &str = "newsharvest-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Status(#[from] UnknownStatus),
    #[error("article {0} does not exist")]
    MissingArticle(ArticleId),
    #[error("injected store failure: {0}")]
    Injected(String),
}

/// How a successful fetch was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Inserted,
    /// A content row for the article already existed; status still moves to success.
    AlreadyCrawled,
}

/// Durable store shared by the harvest, classify and crawl stages.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// URLs whose API retrieval time is later than `since`.
    async fn recent_urls(&self, since: DateTime<Utc>) -> Result<HashSet<String>, StoreError>;

    /// Inserts with conflict-on-URL ignored. Rows that fail are skipped without
    /// aborting the batch. Returns the number of rows actually inserted.
    async fn insert_articles(&self, articles: &[NewArticle]) -> Result<u64, StoreError>;

    /// Every `pending` record, newest id first.
    async fn pending_articles(&self) -> Result<Vec<PendingArticle>, StoreError>;

    /// Applies both partitions in a single transaction.
    async fn apply_classification(&self, classification: &Classification) -> Result<(), StoreError>;

    /// `pending` records already stamped with a filter version, newest publication first.
    async fn eligible_articles(&self) -> Result<Vec<CrawlTarget>, StoreError>;

    /// Dedicated connection for one crawl worker.
    async fn open_session(&self) -> Result<Box<dyn CrawlSession>, StoreError>;

    /// Resets `crawling` records claimed before `claimed_before` back to `pending`.
    async fn release_stuck_crawling(&self, claimed_before: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn status_counts(&self) -> Result<Vec<(CrawlStatus, i64)>, StoreError>;
}

/// Per-record claim -> finalize operations, run on one worker's own connection.
#[async_trait]
pub trait CrawlSession: Send {
    /// `pending` -> `crawling`, incrementing the attempt counter.
    async fn claim(&mut self, id: ArticleId) -> Result<(), StoreError>;

    /// Stores the content row and moves the record to `crawl_success`.
    async fn complete(&mut self, content: &CrawledContent) -> Result<Completion, StoreError>;

    async fn fail(&mut self, id: ArticleId) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "news".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_connections: 10,
        }
    }
}

impl StoreConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
    }
}

const INSERT_ARTICLE: &str = r#"
    INSERT INTO articles (title, pub_date, url, search_keyword, api_request_date)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (url) DO NOTHING
"#;

const MARK_STATUS: &str = "UPDATE articles SET crawl_status = $1 WHERE id = $2";

#[derive(Debug, Clone)]
pub struct PgArticleStore {
    pool: PgPool,
}

impl PgArticleStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(config.connect_options())
            .await?;
        Ok(Self { pool })
    }

    pub async fn connect_url(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ArticleStore for PgArticleStore {
    async fn recent_urls(&self, since: DateTime<Utc>) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT url FROM articles WHERE api_request_date > $1")
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get::<String, _>("url")?);
        }
        Ok(out)
    }

    async fn insert_articles(&self, articles: &[NewArticle]) -> Result<u64, StoreError> {
        if articles.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for article in articles {
            let mut savepoint = Connection::begin(&mut *tx).await?;
            let result = sqlx::query(INSERT_ARTICLE)
                .bind(&article.title)
                .bind(article.pub_date)
                .bind(&article.url)
                .bind(&article.search_keyword)
                .bind(article.api_request_date)
                .execute(&mut *savepoint)
                .await;
            match result {
                Ok(done) => {
                    savepoint.commit().await?;
                    inserted += done.rows_affected();
                }
                Err(err) => {
                    warn!(url = %article.url, error = %err, "article insert failed; skipping row");
                    savepoint.rollback().await?;
                }
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn pending_articles(&self) -> Result<Vec<PendingArticle>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, url
              FROM articles
             WHERE crawl_status = 'pending'
             ORDER BY id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(PendingArticle {
                id: row.try_get("id")?,
                url: row.try_get("url")?,
            });
        }
        Ok(out)
    }

    async fn apply_classification(&self, classification: &Classification) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        if !classification.filtered.is_empty() {
            sqlx::query(
                r#"
                UPDATE articles
                   SET crawl_status = 'url_filtered',
                       url_filter_version = $1
                 WHERE id = ANY($2)
                "#,
            )
            .bind(&classification.filter_version)
            .bind(classification.filtered.as_slice())
            .execute(&mut *tx)
            .await?;
        }

        if !classification.passed.is_empty() {
            sqlx::query("UPDATE articles SET url_filter_version = $1 WHERE id = ANY($2)")
                .bind(&classification.filter_version)
                .bind(classification.passed.as_slice())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn eligible_articles(&self) -> Result<Vec<CrawlTarget>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, title, pub_date
              FROM articles
             WHERE crawl_status = 'pending'
               AND url_filter_version IS NOT NULL
             ORDER BY pub_date DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CrawlTarget {
                id: row.try_get("id")?,
                url: row.try_get("url")?,
                title: row.try_get("title")?,
                pub_date: row.try_get("pub_date")?,
            });
        }
        Ok(out)
    }

    async fn open_session(&self) -> Result<Box<dyn CrawlSession>, StoreError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgCrawlSession { conn }))
    }

    async fn release_stuck_crawling(&self, claimed_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE articles
               SET crawl_status = 'pending'
             WHERE crawl_status = 'crawling'
               AND (crawl_claimed_at IS NULL OR crawl_claimed_at < $1)
            "#,
        )
        .bind(claimed_before)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn status_counts(&self) -> Result<Vec<(CrawlStatus, i64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT crawl_status, COUNT(*) AS n FROM articles GROUP BY crawl_status ORDER BY crawl_status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("crawl_status")?;
            out.push((status.parse()?, row.try_get("n")?));
        }
        Ok(out)
    }
}

pub struct PgCrawlSession {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl CrawlSession for PgCrawlSession {
    async fn claim(&mut self, id: ArticleId) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE articles
               SET crawl_status = 'crawling',
                   crawl_attempt_count = crawl_attempt_count + 1,
                   crawl_claimed_at = now()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn complete(&mut self, content: &CrawledContent) -> Result<Completion, StoreError> {
        let mut tx = Connection::begin(&mut *self.conn).await?;
        let insert = sqlx::query(
            r#"
            INSERT INTO crawled_articles (article_id, text, crawler_version, response_time_ms, crawled_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(content.article_id)
        .bind(&content.text)
        .bind(&content.crawler_version)
        .bind(content.response_time_ms)
        .bind(content.crawled_at)
        .execute(&mut *tx)
        .await;

        match insert {
            Ok(_) => {
                sqlx::query(MARK_STATUS)
                    .bind(CrawlStatus::CrawlSuccess.as_str())
                    .bind(content.article_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(Completion::Inserted)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tx.rollback().await?;
                debug!(article_id = content.article_id, "content row already present");
                sqlx::query(MARK_STATUS)
                    .bind(CrawlStatus::CrawlSuccess.as_str())
                    .bind(content.article_id)
                    .execute(&mut *self.conn)
                    .await?;
                Ok(Completion::AlreadyCrawled)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn fail(&mut self, id: ArticleId) -> Result<(), StoreError> {
        sqlx::query(MARK_STATUS)
            .bind(CrawlStatus::CrawlFailed.as_str())
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }
}
