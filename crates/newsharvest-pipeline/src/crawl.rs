//! Full-text crawl of vetted records through a bounded worker pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use newsharvest_core::{ArticleId, CrawlTarget, CrawledContent};
use newsharvest_sources::{ArticleExtractor, HttpClientConfig};
use newsharvest_storage::{ArticleStore, Completion, CrawlSession, StoreError};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::classify::Classifier;

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub filter_file: PathBuf,
    pub crawler_version: String,
    pub max_workers: usize,
    /// Passed to the extractor as a language hint.
    pub language: String,
    pub http: HttpClientConfig,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            filter_file: PathBuf::from("filters/filter_domain_list_v1.00.txt"),
            crawler_version: "1.0.0".to_string(),
            max_workers: 5,
            language: "ko".to_string(),
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlOutcome {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrawlTally {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlRunSummary {
    pub filtered: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_secs: f64,
}

/// Body text (if any) and how long the fetch took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub text: Option<String>,
    pub response_time_ms: i64,
}

/// Fetches one article; extractor errors and blank bodies both yield `text: None`.
pub async fn fetch_article(extractor: &dyn ArticleExtractor, url: &str, language: &str) -> FetchResult {
    let started = Instant::now();
    let text = match extractor.extract(url, language).await {
        Ok(text) => text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        Err(err) => {
            debug!(url, error = %err, "article fetch failed");
            None
        }
    };
    FetchResult {
        text,
        response_time_ms: started.elapsed().as_millis() as i64,
    }
}

#[derive(Debug)]
struct WorkerSettings {
    crawler_version: String,
    language: String,
}

pub struct Crawler {
    store: Arc<dyn ArticleStore>,
    extractor: Arc<dyn ArticleExtractor>,
    classifier: Classifier,
    config: CrawlConfig,
}

impl Crawler {
    pub fn new(
        store: Arc<dyn ArticleStore>,
        extractor: Arc<dyn ArticleExtractor>,
        config: CrawlConfig,
    ) -> Self {
        let classifier = Classifier::new(Arc::clone(&store), config.filter_file.clone());
        Self {
            store,
            extractor,
            classifier,
            config,
        }
    }

    /// Classifies pending records against the configured blocklist; returns the filtered count.
    pub async fn filter_urls(&self) -> Result<usize> {
        Ok(self.classifier.classify().await?.filtered)
    }

    pub async fn crawl_news(&self) -> Result<CrawlTally> {
        let targets = self
            .store
            .eligible_articles()
            .await
            .context("loading crawl targets")?;
        if targets.is_empty() {
            info!("no articles to crawl");
            return Ok(CrawlTally::default());
        }

        let total = targets.len();
        let workers = self.config.max_workers.max(1);
        info!(total, workers, "crawl starting");

        let settings = Arc::new(WorkerSettings {
            crawler_version: self.config.crawler_version.clone(),
            language: self.config.language.clone(),
        });

        let mut completions = stream::iter(targets.into_iter().enumerate())
            .map(|(idx, target)| {
                let id = target.id;
                let store = Arc::clone(&self.store);
                let extractor = Arc::clone(&self.extractor);
                let settings = Arc::clone(&settings);
                let span = info_span!("crawl_article", article_id = id);
                let handle = tokio::spawn(
                    process_article(store, extractor, settings, target, idx + 1, total).instrument(span),
                );
                async move { (id, handle.await) }
            })
            .buffer_unordered(workers);

        let mut tally = CrawlTally::default();
        while let Some((id, joined)) = completions.next().await {
            match joined {
                Ok(CrawlOutcome::Success) => tally.succeeded += 1,
                Ok(CrawlOutcome::Failed) => tally.failed += 1,
                Err(err) => {
                    error!(article_id = id, error = %err, "crawl worker aborted");
                    self.mark_aborted(id).await;
                    tally.failed += 1;
                }
            }
        }

        info!(succeeded = tally.succeeded, failed = tally.failed, "crawl finished");
        Ok(tally)
    }

    /// A worker that died mid-record leaves it `crawling`; settle it as failed.
    async fn mark_aborted(&self, id: ArticleId) {
        let result = match self.store.open_session().await {
            Ok(mut session) => session.fail(id).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            error!(article_id = id, error = %err, "could not mark aborted article as failed; sweep will release it");
        }
    }

    /// Classification followed by the crawl.
    pub async fn run(&self) -> Result<CrawlRunSummary> {
        let started = Instant::now();
        info!(
            crawler_version = %self.config.crawler_version,
            filter_file = %self.config.filter_file.display(),
            workers = self.config.max_workers,
            "news crawler starting"
        );

        let filtered = self.filter_urls().await?;
        let tally = self.crawl_news().await?;

        let elapsed_secs = started.elapsed().as_secs_f64();
        info!(
            filtered,
            succeeded = tally.succeeded,
            failed = tally.failed,
            elapsed_secs = %format!("{elapsed_secs:.2}"),
            "news crawler finished"
        );
        if tally.succeeded > 0 {
            info!(
                secs_per_article = %format!("{:.2}", elapsed_secs / tally.succeeded as f64),
                "average processing time"
            );
        }

        Ok(CrawlRunSummary {
            filtered,
            succeeded: tally.succeeded,
            failed: tally.failed,
            elapsed_secs,
        })
    }
}

async fn process_article(
    store: Arc<dyn ArticleStore>,
    extractor: Arc<dyn ArticleExtractor>,
    settings: Arc<WorkerSettings>,
    target: CrawlTarget,
    idx: usize,
    total: usize,
) -> CrawlOutcome {
    let mut session = match store.open_session().await {
        Ok(session) => session,
        Err(err) => {
            error!(error = %err, "could not open store session; record left pending");
            return CrawlOutcome::Failed;
        }
    };

    match crawl_with_session(session.as_mut(), extractor.as_ref(), &settings, &target, idx, total).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(url = %target.url, error = %err, "crawl failed");
            if let Err(err) = session.fail(target.id).await {
                error!(error = %err, "could not mark article as failed");
            }
            CrawlOutcome::Failed
        }
    }
}

async fn crawl_with_session(
    session: &mut dyn CrawlSession,
    extractor: &dyn ArticleExtractor,
    settings: &WorkerSettings,
    target: &CrawlTarget,
    idx: usize,
    total: usize,
) -> Result<CrawlOutcome, StoreError> {
    session.claim(target.id).await?;
    let short_title: String = target.title.chars().take(50).collect();
    info!("[{idx}/{total}] {short_title}...");

    let fetched = fetch_article(extractor, &target.url, &settings.language).await;
    let Some(text) = fetched.text else {
        session.fail(target.id).await?;
        warn!(elapsed_ms = fetched.response_time_ms, "no article body; marked failed");
        return Ok(CrawlOutcome::Failed);
    };

    let chars = text.chars().count();
    let content = CrawledContent {
        article_id: target.id,
        text,
        crawler_version: settings.crawler_version.clone(),
        response_time_ms: fetched.response_time_ms,
        crawled_at: Utc::now(),
    };
    match session.complete(&content).await? {
        Completion::Inserted => {
            info!(chars, elapsed_ms = fetched.response_time_ms, "crawled");
        }
        Completion::AlreadyCrawled => {
            warn!("content already stored; treating as success");
        }
    }
    Ok(CrawlOutcome::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use newsharvest_core::{CrawlStatus, FilterSet, NewArticle};
    use newsharvest_sources::ExtractError;
    use newsharvest_storage::MemoryArticleStore;

    #[derive(Clone)]
    enum Page {
        Text(&'static str),
        Blank,
        Broken,
        Panics,
    }

    #[derive(Default)]
    struct StubExtractor {
        pages: HashMap<String, Page>,
        delay: Option<Duration>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl StubExtractor {
        fn with_pages(pages: &[(&str, Page)]) -> Self {
            Self {
                pages: pages.iter().map(|(u, p)| (u.to_string(), p.clone())).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ArticleExtractor for StubExtractor {
        async fn extract(&self, url: &str, _language: &str) -> Result<Option<String>, ExtractError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match self.pages.get(url).cloned().unwrap_or(Page::Text("default body")) {
                Page::Text(text) => Ok(Some(text.to_string())),
                Page::Blank => Ok(Some("   ".to_string())),
                Page::Broken => Err(ExtractError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                }),
                Page::Panics => panic!("extractor blew up on {url}"),
            }
        }
    }

    async fn seed(store: &MemoryArticleStore, urls: &[&str]) {
        let batch: Vec<NewArticle> = urls
            .iter()
            .enumerate()
            .map(|(i, url)| NewArticle {
                url: url.to_string(),
                title: format!("title {i}"),
                pub_date: Utc.with_ymd_and_hms(2026, 3, 1, 0, i as u32, 0).single().unwrap(),
                search_keyword: "kw".into(),
                api_request_date: Utc::now(),
            })
            .collect();
        store.insert_articles(&batch).await.unwrap();
    }

    fn config(filter_file: PathBuf, max_workers: usize) -> CrawlConfig {
        CrawlConfig {
            filter_file,
            crawler_version: "9.9.9".into(),
            max_workers,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn end_to_end_single_record() {
        let dir = tempfile::tempdir().unwrap();
        let filter_file = dir.path().join("filter_domain_list_v1.00.txt");
        std::fs::write(&filter_file, "").unwrap();

        let store = MemoryArticleStore::new();
        seed(&store, &["https://press.example/1"]).await;
        let extractor = StubExtractor {
            delay: Some(Duration::from_millis(25)),
            ..StubExtractor::with_pages(&[("https://press.example/1", Page::Text("hello"))])
        };
        let crawler = Crawler::new(Arc::new(store.clone()), Arc::new(extractor), config(filter_file, 2));

        let summary = crawler.run().await.unwrap();
        assert_eq!((summary.filtered, summary.succeeded, summary.failed), (0, 1, 0));

        let record = store.article(1).await.unwrap();
        assert_eq!(record.crawl_status, CrawlStatus::CrawlSuccess);
        assert_eq!(record.crawl_attempt_count, 1);
        assert_eq!(record.url_filter_version.as_deref(), Some("v1.00"));
        let content = store.content(1).await.unwrap();
        assert_eq!(content.text, "hello");
        assert_eq!(content.crawler_version, "9.9.9");
        assert!(content.response_time_ms >= 25, "response_time_ms {}", content.response_time_ms);
        assert_eq!(store.content_count().await, 1);
    }

    #[tokio::test]
    async fn panicking_worker_leaves_record_failed_not_crawling() {
        let store = MemoryArticleStore::new();
        seed(&store, &["https://press.example/boom", "https://press.example/ok"]).await;
        Classifier::new(Arc::new(store.clone()), "none_v1.txt")
            .classify_with(&FilterSet::new("v1", std::iter::empty::<&str>()))
            .await
            .unwrap();
        let extractor = StubExtractor::with_pages(&[
            ("https://press.example/boom", Page::Panics),
            ("https://press.example/ok", Page::Text("fine")),
        ]);
        let crawler = Crawler::new(
            Arc::new(store.clone()),
            Arc::new(extractor),
            config(PathBuf::from("none_v1.txt"), 2),
        );

        let tally = crawler.crawl_news().await.unwrap();
        assert_eq!(tally, CrawlTally { succeeded: 1, failed: 1 });
        let boom = store.article_by_url("https://press.example/boom").await.unwrap();
        assert_eq!(boom.crawl_status, CrawlStatus::CrawlFailed);
        assert_eq!(boom.crawl_attempt_count, 1);
        assert!(store
            .articles()
            .await
            .iter()
            .all(|a| a.crawl_status != CrawlStatus::Crawling));
    }

    #[tokio::test]
    async fn every_eligible_record_ends_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let filter_file = dir.path().join("blocklist_v3.txt");
        std::fs::write(&filter_file, "blocked.com\n").unwrap();

        let store = MemoryArticleStore::new();
        seed(
            &store,
            &[
                "https://sub.blocked.com/1",
                "https://ok.example/2",
                "https://blank.example/3",
                "https://broken.example/4",
            ],
        )
        .await;
        let extractor = StubExtractor::with_pages(&[
            ("https://ok.example/2", Page::Text("body")),
            ("https://blank.example/3", Page::Blank),
            ("https://broken.example/4", Page::Broken),
        ]);
        let crawler = Crawler::new(Arc::new(store.clone()), Arc::new(extractor), config(filter_file, 3));

        let summary = crawler.run().await.unwrap();
        assert_eq!((summary.filtered, summary.succeeded, summary.failed), (1, 1, 2));

        let statuses: Vec<(String, CrawlStatus, i32)> = store
            .articles()
            .await
            .into_iter()
            .map(|a| (a.url, a.crawl_status, a.crawl_attempt_count))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("https://sub.blocked.com/1".to_string(), CrawlStatus::UrlFiltered, 0),
                ("https://ok.example/2".to_string(), CrawlStatus::CrawlSuccess, 1),
                ("https://blank.example/3".to_string(), CrawlStatus::CrawlFailed, 1),
                ("https://broken.example/4".to_string(), CrawlStatus::CrawlFailed, 1),
            ]
        );
        assert_eq!(store.content_count().await, 1);
    }

    #[tokio::test]
    async fn unclassified_records_are_not_crawled() {
        let store = MemoryArticleStore::new();
        seed(&store, &["https://press.example/1"]).await;
        let crawler = Crawler::new(
            Arc::new(store.clone()),
            Arc::new(StubExtractor::default()),
            CrawlConfig::default(),
        );

        assert_eq!(crawler.crawl_news().await.unwrap(), CrawlTally::default());
        assert_eq!(store.article(1).await.unwrap().crawl_status, CrawlStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_workers_both_report_success() {
        let store = MemoryArticleStore::new();
        seed(&store, &["https://press.example/1"]).await;
        let shared: Arc<dyn ArticleStore> = Arc::new(store.clone());
        let extractor: Arc<dyn ArticleExtractor> =
            Arc::new(StubExtractor::with_pages(&[("https://press.example/1", Page::Text("once"))]));
        let settings = Arc::new(WorkerSettings {
            crawler_version: "1.0.0".into(),
            language: "ko".into(),
        });
        let target = CrawlTarget {
            id: 1,
            url: "https://press.example/1".into(),
            title: "t".into(),
            pub_date: Utc::now(),
        };

        let (a, b) = tokio::join!(
            process_article(shared.clone(), extractor.clone(), settings.clone(), target.clone(), 1, 2),
            process_article(shared, extractor, settings, target, 2, 2),
        );
        assert_eq!((a, b), (CrawlOutcome::Success, CrawlOutcome::Success));
        assert_eq!(store.content_count().await, 1);
        let record = store.article(1).await.unwrap();
        assert_eq!(record.crawl_status, CrawlStatus::CrawlSuccess);
        assert_eq!(record.crawl_attempt_count, 2);
    }

    #[tokio::test]
    async fn worker_pool_is_bounded() {
        let store = MemoryArticleStore::new();
        let urls: Vec<String> = (0..8).map(|i| format!("https://press.example/{i}")).collect();
        let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        seed(&store, &refs).await;
        Classifier::new(Arc::new(store.clone()), "none_v1.txt")
            .classify_with(&FilterSet::new("v1", std::iter::empty::<&str>()))
            .await
            .unwrap();

        let extractor = Arc::new(StubExtractor {
            delay: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let crawler = Crawler::new(
            Arc::new(store.clone()),
            extractor.clone(),
            config(PathBuf::from("none_v1.txt"), 3),
        );

        let tally = crawler.crawl_news().await.unwrap();
        assert_eq!(tally, CrawlTally { succeeded: 8, failed: 0 });
        let peak = extractor.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak}");
        assert!(peak >= 2, "peak concurrency {peak}");
    }

    #[tokio::test]
    async fn fetch_article_times_and_trims() {
        let extractor = StubExtractor::with_pages(&[
            ("https://a/1", Page::Text("  padded  ")),
            ("https://a/2", Page::Broken),
        ]);
        let ok = fetch_article(&extractor, "https://a/1", "ko").await;
        let broken = fetch_article(&extractor, "https://a/2", "ko").await;
        assert_eq!(ok.text.as_deref(), Some("padded"));
        assert_eq!(broken.text, None);
        assert!(broken.response_time_ms >= 0);
    }
}
