use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsharvest_core::{
    ArticleId, ArticleRecord, Classification, CrawlStatus, CrawlTarget, CrawledContent,
    NewArticle, PendingArticle,
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::{ArticleStore, Completion, CrawlSession, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: ArticleId,
    articles: BTreeMap<ArticleId, ArticleRecord>,
    by_url: HashMap<String, ArticleId>,
    contents: BTreeMap<ArticleId, CrawledContent>,
    failing_urls: HashSet<String>,
    fail_next_classification: bool,
}

/// Process-local store with the same conflict semantics as the PostgreSQL one.
///
/// Useful for dry runs and for exercising the pipeline without a database.
/// Sessions share the state, so racing workers observe each other's writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryArticleStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryArticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts of `url` fail as if the database rejected the row.
    pub async fn inject_insert_failure(&self, url: impl Into<String>) {
        self.state.lock().await.failing_urls.insert(url.into());
    }

    /// The next classification pass fails before anything is written.
    pub async fn fail_next_classification(&self) {
        self.state.lock().await.fail_next_classification = true;
    }

    pub async fn article(&self, id: ArticleId) -> Option<ArticleRecord> {
        self.state.lock().await.articles.get(&id).cloned()
    }

    pub async fn article_by_url(&self, url: &str) -> Option<ArticleRecord> {
        let state = self.state.lock().await;
        state
            .by_url
            .get(url)
            .and_then(|id| state.articles.get(id))
            .cloned()
    }

    pub async fn articles(&self) -> Vec<ArticleRecord> {
        self.state.lock().await.articles.values().cloned().collect()
    }

    pub async fn content(&self, id: ArticleId) -> Option<CrawledContent> {
        self.state.lock().await.contents.get(&id).cloned()
    }

    pub async fn content_count(&self) -> usize {
        self.state.lock().await.contents.len()
    }
}

#[async_trait]
impl ArticleStore for MemoryArticleStore {
    async fn recent_urls(&self, since: DateTime<Utc>) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .articles
            .values()
            .filter(|a| a.api_request_date > since)
            .map(|a| a.url.clone())
            .collect())
    }

    async fn insert_articles(&self, articles: &[NewArticle]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0u64;
        for article in articles {
            if state.failing_urls.contains(&article.url) {
                warn!(url = %article.url, "article insert failed; skipping row");
                continue;
            }
            if state.by_url.contains_key(&article.url) {
                continue;
            }
            state.next_id += 1;
            let id = state.next_id;
            state.by_url.insert(article.url.clone(), id);
            state.articles.insert(
                id,
                ArticleRecord {
                    id,
                    url: article.url.clone(),
                    title: article.title.clone(),
                    pub_date: article.pub_date,
                    search_keyword: article.search_keyword.clone(),
                    api_request_date: article.api_request_date,
                    crawl_status: CrawlStatus::Pending,
                    url_filter_version: None,
                    crawl_attempt_count: 0,
                    crawl_claimed_at: None,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn pending_articles(&self) -> Result<Vec<PendingArticle>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .articles
            .values()
            .rev()
            .filter(|a| a.crawl_status == CrawlStatus::Pending)
            .map(|a| PendingArticle {
                id: a.id,
                url: a.url.clone(),
            })
            .collect())
    }

    async fn apply_classification(&self, classification: &Classification) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if std::mem::take(&mut state.fail_next_classification) {
            return Err(StoreError::Injected("classification pass".to_string()));
        }
        for id in &classification.filtered {
            if let Some(article) = state.articles.get_mut(id) {
                article.crawl_status = CrawlStatus::UrlFiltered;
                article.url_filter_version = Some(classification.filter_version.clone());
            }
        }
        for id in &classification.passed {
            if let Some(article) = state.articles.get_mut(id) {
                article.url_filter_version = Some(classification.filter_version.clone());
            }
        }
        Ok(())
    }

    async fn eligible_articles(&self) -> Result<Vec<CrawlTarget>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<CrawlTarget> = state
            .articles
            .values()
            .filter(|a| a.crawl_status == CrawlStatus::Pending && a.url_filter_version.is_some())
            .map(|a| CrawlTarget {
                id: a.id,
                url: a.url.clone(),
                title: a.title.clone(),
                pub_date: a.pub_date,
            })
            .collect();
        out.sort_by(|a, b| b.pub_date.cmp(&a.pub_date));
        Ok(out)
    }

    async fn open_session(&self) -> Result<Box<dyn CrawlSession>, StoreError> {
        Ok(Box::new(MemoryCrawlSession {
            state: Arc::clone(&self.state),
        }))
    }

    async fn release_stuck_crawling(&self, claimed_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut released = 0u64;
        for article in state.articles.values_mut() {
            let stale = article.crawl_claimed_at.map_or(true, |at| at < claimed_before);
            if article.crawl_status == CrawlStatus::Crawling && stale {
                article.crawl_status = CrawlStatus::Pending;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn status_counts(&self) -> Result<Vec<(CrawlStatus, i64)>, StoreError> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<CrawlStatus, i64> = BTreeMap::new();
        for article in state.articles.values() {
            *counts.entry(article.crawl_status).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }
}

struct MemoryCrawlSession {
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl CrawlSession for MemoryCrawlSession {
    async fn claim(&mut self, id: ArticleId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(article) = state.articles.get_mut(&id) {
            article.crawl_status = CrawlStatus::Crawling;
            article.crawl_attempt_count += 1;
            article.crawl_claimed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn complete(&mut self, content: &CrawledContent) -> Result<Completion, StoreError> {
        let mut state = self.state.lock().await;
        if !state.articles.contains_key(&content.article_id) {
            return Err(StoreError::MissingArticle(content.article_id));
        }
        let completion = if state.contents.contains_key(&content.article_id) {
            Completion::AlreadyCrawled
        } else {
            state.contents.insert(content.article_id, content.clone());
            Completion::Inserted
        };
        if let Some(article) = state.articles.get_mut(&content.article_id) {
            article.crawl_status = CrawlStatus::CrawlSuccess;
        }
        Ok(completion)
    }

    async fn fail(&mut self, id: ArticleId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(article) = state.articles.get_mut(&id) {
            article.crawl_status = CrawlStatus::CrawlFailed;
        }
        Ok(())
    }
}
