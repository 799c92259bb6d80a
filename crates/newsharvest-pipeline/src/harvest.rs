//! Keyword harvest: paginate the search provider and insert unseen articles as `pending`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use newsharvest_core::NewArticle;
use newsharvest_sources::{parse_pub_date, strip_markup, SearchItem, SearchProvider, SearchRequest, SortOrder};
use newsharvest_storage::ArticleStore;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Upper bound on results per request.
    pub page_size: u32,
    /// Largest start offset the provider will address.
    pub max_start: u32,
    /// Fixed delay before every search request.
    pub pacing: Duration,
    /// URLs retrieved within this window are skipped without re-inserting.
    pub recent_window: chrono::Duration,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_start: 1000,
            pacing: Duration::from_millis(110),
            recent_window: chrono::Duration::days(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NoItems,
    NoNewInserts,
    StartLimit,
    TargetReached,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub run_id: Uuid,
    pub keyword: String,
    pub target: usize,
    pub pages: usize,
    pub collected: usize,
    pub inserted: u64,
    pub unparseable: usize,
    pub stop_reason: StopReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Dedup state for one harvest run: recently stored URLs plus URLs seen in this run.
#[derive(Debug, Default)]
pub struct SeenUrls {
    existing: HashSet<String>,
    in_run: HashSet<String>,
}

impl SeenUrls {
    pub fn new(existing: HashSet<String>) -> Self {
        Self {
            existing,
            in_run: HashSet::new(),
        }
    }

    /// True the first time an unstored URL is offered.
    pub fn admit(&mut self, url: &str) -> bool {
        !self.existing.contains(url) && self.in_run.insert(url.to_string())
    }

    pub fn in_run_len(&self) -> usize {
        self.in_run.len()
    }
}

pub fn normalize_item(
    item: &SearchItem,
    keyword: &str,
    requested_at: DateTime<Utc>,
) -> Result<NewArticle, chrono::ParseError> {
    Ok(NewArticle {
        url: item.link.clone(),
        title: strip_markup(&item.title),
        pub_date: parse_pub_date(&item.pub_date)?,
        search_keyword: keyword.to_string(),
        api_request_date: requested_at,
    })
}

pub struct Harvester {
    store: Arc<dyn ArticleStore>,
    provider: Arc<dyn SearchProvider>,
    config: HarvestConfig,
}

impl Harvester {
    pub fn new(
        store: Arc<dyn ArticleStore>,
        provider: Arc<dyn SearchProvider>,
        config: HarvestConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Harvests up to `target` search results for `keyword`, returning how many were inserted.
    pub async fn harvest(&self, keyword: &str, target: usize) -> Result<HarvestSummary> {
        ensure!(target > 0, "harvest target count must be positive");
        let run_id = Uuid::new_v4();
        self.harvest_inner(run_id, keyword, target)
            .instrument(info_span!("harvest", %run_id, keyword))
            .await
    }

    async fn harvest_inner(&self, run_id: Uuid, keyword: &str, target: usize) -> Result<HarvestSummary> {
        let started_at = Utc::now();
        info!(target, "harvest starting");

        let existing = self
            .store
            .recent_urls(started_at - self.config.recent_window)
            .await
            .context("loading recently harvested urls")?;
        let mut seen = SeenUrls::new(existing);

        let page_size = self.config.page_size.max(1) as usize;
        let mut collected = 0usize;
        let mut inserted_total = 0u64;
        let mut unparseable = 0usize;
        let mut pages = 0usize;
        let mut start = 1u32;
        let mut stop_reason = StopReason::TargetReached;

        while collected < target {
            if !self.config.pacing.is_zero() {
                tokio::time::sleep(self.config.pacing).await;
            }

            let display = page_size.min(target - collected) as u32;
            let request = SearchRequest {
                query: keyword.to_string(),
                display,
                start,
                sort: SortOrder::Date,
            };
            let items = match self.provider.search(&request).await {
                Ok(page) => page.items,
                Err(err) => {
                    error!(start, error = %err, "search request failed");
                    Vec::new()
                }
            };
            pages += 1;

            if items.is_empty() {
                info!(start, "no more search results");
                stop_reason = StopReason::NoItems;
                break;
            }

            let requested_at = Utc::now();
            let mut batch = Vec::new();
            for item in &items {
                if !seen.admit(&item.link) {
                    continue;
                }
                match normalize_item(item, keyword, requested_at) {
                    Ok(article) => batch.push(article),
                    Err(err) => {
                        unparseable += 1;
                        warn!(url = %item.link, pub_date = %item.pub_date, error = %err, "skipping item with unparseable date");
                    }
                }
            }

            let previous_total = inserted_total;
            let inserted = self
                .store
                .insert_articles(&batch)
                .await
                .context("inserting harvested articles")?;
            inserted_total += inserted;
            collected += items.len();
            info!(collected, inserted, inserted_total, "harvest progress");

            if inserted_total == previous_total {
                info!("no new articles inserted on this page; stopping");
                stop_reason = StopReason::NoNewInserts;
                break;
            }

            start += display;
            if start > self.config.max_start {
                info!(start, max_start = self.config.max_start, "provider start offset limit reached");
                stop_reason = StopReason::StartLimit;
                break;
            }
        }

        let finished_at = Utc::now();
        info!(
            collected,
            inserted = inserted_total,
            seen = seen.in_run_len(),
            stop_reason = ?stop_reason,
            "harvest finished"
        );

        Ok(HarvestSummary {
            run_id,
            keyword: keyword.to_string(),
            target,
            pages,
            collected,
            inserted: inserted_total,
            unparseable,
            stop_reason,
            started_at,
            finished_at,
        })
    }
}
