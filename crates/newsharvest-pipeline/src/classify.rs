use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use newsharvest_core::FilterSet;
use newsharvest_storage::ArticleStore;
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifySummary {
    pub filter_version: String,
    pub filter_domains: usize,
    pub examined: usize,
    pub filtered: usize,
    pub passed: usize,
}

/// Stamps every pending record with the blocklist version, marking blocked domains `url_filtered`.
pub struct Classifier {
    store: Arc<dyn ArticleStore>,
    filter_file: PathBuf,
}

impl Classifier {
    pub fn new(store: Arc<dyn ArticleStore>, filter_file: impl Into<PathBuf>) -> Self {
        Self {
            store,
            filter_file: filter_file.into(),
        }
    }

    /// Reloads the blocklist file and classifies all pending records.
    pub async fn classify(&self) -> Result<ClassifySummary> {
        let filters = FilterSet::load_or_empty(&self.filter_file);
        self.classify_with(&filters).await
    }

    pub async fn classify_with(&self, filters: &FilterSet) -> Result<ClassifySummary> {
        let pending = self
            .store
            .pending_articles()
            .await
            .context("loading pending articles")?;

        let mut summary = ClassifySummary {
            filter_version: filters.version().to_string(),
            filter_domains: filters.len(),
            examined: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            info!("no pending articles to classify");
            return Ok(summary);
        }

        info!(pending = pending.len(), version = filters.version(), "url filtering starting");
        let classification = filters.classify(&pending);
        if let Err(err) = self.store.apply_classification(&classification).await {
            error!(error = %err, "url filtering rolled back");
            return Err(err).context("applying url classification");
        }

        summary.filtered = classification.filtered.len();
        summary.passed = classification.passed.len();
        info!(
            filtered = summary.filtered,
            passed = summary.passed,
            "url filtering finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use newsharvest_core::{CrawlStatus, NewArticle};
    use newsharvest_storage::MemoryArticleStore;

    async fn seeded(urls: &[&str]) -> MemoryArticleStore {
        let store = MemoryArticleStore::new();
        let now = Utc::now();
        let batch: Vec<NewArticle> = urls
            .iter()
            .map(|url| NewArticle {
                url: url.to_string(),
                title: "t".into(),
                pub_date: now,
                search_keyword: "kw".into(),
                api_request_date: now,
            })
            .collect();
        store.insert_articles(&batch).await.unwrap();
        store
    }

    #[tokio::test]
    async fn blocked_domains_are_filtered_and_others_stamped() {
        let store = seeded(&[
            "https://news.naver.com/a",
            "https://www.daum.net/b",
            "https://press.example/c",
        ])
        .await;
        let classifier = Classifier::new(Arc::new(store.clone()), "unused_v0.txt");
        let filters = FilterSet::new("v1.00", ["naver.com", "m.daum.net"]);

        let summary = classifier.classify_with(&filters).await.unwrap();
        assert_eq!(summary.examined, 3);
        assert_eq!(summary.filtered, 2);
        assert_eq!(summary.passed, 1);

        for record in store.articles().await {
            assert_eq!(record.url_filter_version.as_deref(), Some("v1.00"));
            let expected = if record.url == "https://press.example/c" {
                CrawlStatus::Pending
            } else {
                CrawlStatus::UrlFiltered
            };
            assert_eq!(record.crawl_status, expected, "{}", record.url);
        }
    }

    #[tokio::test]
    async fn failed_pass_propagates_and_leaves_records_untouched() {
        let store = seeded(&["https://news.naver.com/a", "https://press.example/c"]).await;
        store.fail_next_classification().await;
        let classifier = Classifier::new(Arc::new(store.clone()), "unused_v0.txt");

        let result = classifier
            .classify_with(&FilterSet::new("v1", ["naver.com"]))
            .await;
        assert!(result.is_err());
        for record in store.articles().await {
            assert_eq!(record.crawl_status, CrawlStatus::Pending);
            assert_eq!(record.url_filter_version, None);
        }
    }

    #[tokio::test]
    async fn classify_loads_version_from_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter_domain_list_v2.05.txt");
        std::fs::write(&path, "www.blocked.com\n").unwrap();
        let store = seeded(&["https://sub.blocked.com/x"]).await;

        let summary = Classifier::new(Arc::new(store.clone()), &path)
            .classify()
            .await
            .unwrap();
        assert_eq!(summary.filter_version, "v2.05");
        assert_eq!(summary.filtered, 1);
        let record = store.article(1).await.unwrap();
        assert_eq!(record.crawl_status, CrawlStatus::UrlFiltered);
    }

    #[tokio::test]
    async fn empty_store_is_a_no_op() {
        let store = MemoryArticleStore::new();
        let summary = Classifier::new(Arc::new(store), "x_v1.txt")
            .classify_with(&FilterSet::new("v1", ["a.com"]))
            .await
            .unwrap();
        assert_eq!(summary.examined, 0);
        assert_eq!(summary.filtered, 0);
    }
}
