//! Harvest, classify and crawl stages wired to a shared article store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use newsharvest_sources::{
    ArticleExtractor, HtmlArticleExtractor, HttpClientConfig, NaverNewsClient, SearchApiConfig,
    SearchError, SearchProvider, NAVER_NEWS_ENDPOINT,
};
use newsharvest_storage::{ArticleStore, PgArticleStore, StoreConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub mod classify;
pub mod crawl;
pub mod harvest;

pub use classify::{ClassifySummary, Classifier};
pub use crawl::{fetch_article, CrawlConfig, CrawlOutcome, CrawlRunSummary, CrawlTally, Crawler, FetchResult};
pub use harvest::{HarvestConfig, HarvestSummary, Harvester, SeenUrls, StopReason};

pub const CRATE_NAME: &str = "newsharvest-pipeline";

pub const DEFAULT_KEYWORD: &str = "다";
pub const DEFAULT_TARGET: usize = 1000;

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Six-field cron expression (seconds first).
    pub cron: String,
    pub jobs_file: PathBuf,
    pub crawl_after_harvest: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 0 * * * *".to_string(),
            jobs_file: PathBuf::from("harvest_jobs.yaml"),
            crawl_after_harvest: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub search: SearchApiConfig,
    pub harvest: HarvestConfig,
    pub crawl: CrawlConfig,
    pub schedule: ScheduleConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let defaults_store = StoreConfig::default();
        let defaults_harvest = HarvestConfig::default();
        let defaults_crawl = CrawlConfig::default();
        let defaults_schedule = ScheduleConfig::default();

        let http = HttpClientConfig {
            timeout: parsed("NEWSHARVEST_HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or_else(|| HttpClientConfig::default().timeout),
            user_agent: lookup("NEWSHARVEST_USER_AGENT").filter(|v| !v.trim().is_empty()),
        };

        Self {
            store: StoreConfig {
                host: var("DB_HOST", defaults_store.host.as_str()),
                port: lookup("DB_PORT")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(defaults_store.port),
                database: var("DB_NAME", defaults_store.database.as_str()),
                user: var("DB_USER", defaults_store.user.as_str()),
                password: var("DB_PASSWORD", defaults_store.password.as_str()),
                max_connections: parsed("NEWSHARVEST_DB_MAX_CONNECTIONS")
                    .map(|v| v as u32)
                    .unwrap_or(defaults_store.max_connections),
            },
            search: SearchApiConfig {
                endpoint: var("NEWSHARVEST_SEARCH_ENDPOINT", NAVER_NEWS_ENDPOINT),
                client_id: var("NAVER_CLIENT_ID", ""),
                client_secret: var("NAVER_CLIENT_SECRET", ""),
                http: http.clone(),
            },
            harvest: HarvestConfig {
                pacing: parsed("NEWSHARVEST_PACING_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults_harvest.pacing),
                ..defaults_harvest
            },
            crawl: CrawlConfig {
                filter_file: lookup("NEWSHARVEST_FILTER_FILE")
                    .map(PathBuf::from)
                    .unwrap_or(defaults_crawl.filter_file),
                crawler_version: var("NEWSHARVEST_CRAWLER_VERSION", defaults_crawl.crawler_version.as_str()),
                max_workers: parsed("NEWSHARVEST_MAX_WORKERS")
                    .map(|v| v as usize)
                    .unwrap_or(defaults_crawl.max_workers),
                language: var("NEWSHARVEST_LANGUAGE", defaults_crawl.language.as_str()),
                http,
            },
            schedule: ScheduleConfig {
                cron: var("NEWSHARVEST_SCHEDULE_CRON", defaults_schedule.cron.as_str()),
                jobs_file: lookup("NEWSHARVEST_JOBS_FILE")
                    .map(PathBuf::from)
                    .unwrap_or(defaults_schedule.jobs_file),
                crawl_after_harvest: lookup("NEWSHARVEST_CRAWL_AFTER_HARVEST")
                    .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                    .unwrap_or(defaults_schedule.crawl_after_harvest),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HarvestJob {
    pub keyword: String,
    #[serde(default = "default_target")]
    pub target: usize,
}

impl Default for HarvestJob {
    fn default() -> Self {
        Self {
            keyword: DEFAULT_KEYWORD.to_string(),
            target: DEFAULT_TARGET,
        }
    }
}

fn default_target() -> usize {
    DEFAULT_TARGET
}

#[derive(Debug, Clone, Deserialize)]
struct HarvestJobRegistry {
    #[serde(default)]
    jobs: Vec<HarvestJob>,
}

/// Reads the scheduled harvest jobs; a missing file yields the single default job.
pub async fn load_harvest_jobs(path: &Path) -> Result<Vec<HarvestJob>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no harvest jobs file; using default job");
            return Ok(vec![HarvestJob::default()]);
        }
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let registry: HarvestJobRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(registry.jobs)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoundSummary {
    pub jobs_run: usize,
    pub jobs_failed: usize,
    pub inserted: u64,
    pub crawl: Option<CrawlRunSummary>,
    /// True when a previous round was still running and this one did nothing.
    pub skipped: bool,
}

pub struct NewsPipeline {
    config: PipelineConfig,
    store: Arc<dyn ArticleStore>,
    search: Option<Arc<dyn SearchProvider>>,
    extractor: Arc<dyn ArticleExtractor>,
    round_lock: Mutex<()>,
}

impl NewsPipeline {
    /// Connects to PostgreSQL and builds the default HTTP collaborators.
    ///
    /// Missing search credentials leave the pipeline usable for every stage except harvest.
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let store = PgArticleStore::connect(&config.store)
            .await
            .with_context(|| format!("connecting to postgres at {}:{}", config.store.host, config.store.port))?;
        let search: Option<Arc<dyn SearchProvider>> = match NaverNewsClient::new(config.search.clone()) {
            Ok(client) => Some(Arc::new(client)),
            Err(SearchError::MissingCredentials) => {
                warn!("NAVER_CLIENT_ID/NAVER_CLIENT_SECRET not set; harvest is unavailable");
                None
            }
            Err(err) => return Err(err).context("building search client"),
        };
        let extractor =
            HtmlArticleExtractor::new(&config.crawl.http).context("building article extractor")?;
        Ok(Self::from_parts(config, Arc::new(store), search, Arc::new(extractor)))
    }

    pub fn from_parts(
        config: PipelineConfig,
        store: Arc<dyn ArticleStore>,
        search: Option<Arc<dyn SearchProvider>>,
        extractor: Arc<dyn ArticleExtractor>,
    ) -> Self {
        Self {
            config,
            store,
            search,
            extractor,
            round_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ArticleStore> {
        Arc::clone(&self.store)
    }

    pub fn harvester(&self) -> Result<Harvester> {
        let provider = self
            .search
            .clone()
            .ok_or_else(|| anyhow!("search provider credentials are not configured"))?;
        Ok(Harvester::new(self.store(), provider, self.config.harvest.clone()))
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::new(self.store(), self.config.crawl.filter_file.clone())
    }

    pub fn crawler(&self) -> Crawler {
        Crawler::new(self.store(), Arc::clone(&self.extractor), self.config.crawl.clone())
    }

    /// Runs every configured harvest job, then optionally the crawler.
    ///
    /// Job failures are logged and counted; a round already in flight makes this one a no-op.
    pub async fn run_scheduled_round(&self) -> RoundSummary {
        let Ok(_guard) = self.round_lock.try_lock() else {
            warn!("previous scheduled round still running; skipping");
            return RoundSummary {
                skipped: true,
                ..Default::default()
            };
        };

        let mut summary = RoundSummary::default();
        let jobs = match load_harvest_jobs(&self.config.schedule.jobs_file).await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "could not load harvest jobs");
                return summary;
            }
        };

        let harvester = match self.harvester() {
            Ok(harvester) => Some(harvester),
            Err(err) => {
                error!(error = %err, "harvest skipped");
                summary.jobs_failed = jobs.len();
                None
            }
        };
        if let Some(harvester) = harvester {
            for job in &jobs {
                summary.jobs_run += 1;
                match harvester.harvest(&job.keyword, job.target).await {
                    Ok(done) => summary.inserted += done.inserted,
                    Err(err) => {
                        summary.jobs_failed += 1;
                        error!(keyword = %job.keyword, error = %err, "harvest job failed");
                    }
                }
            }
        }

        if self.config.schedule.crawl_after_harvest {
            match self.crawler().run().await {
                Ok(crawl) => summary.crawl = Some(crawl),
                Err(err) => error!(error = %err, "scheduled crawl failed"),
            }
        }

        info!(
            jobs_run = summary.jobs_run,
            jobs_failed = summary.jobs_failed,
            inserted = summary.inserted,
            "scheduled round finished"
        );
        summary
    }
}

/// Runs one round immediately, then on the configured cron until Ctrl-C.
pub async fn run_scheduler(pipeline: Arc<NewsPipeline>) -> Result<()> {
    pipeline.run_scheduled_round().await;

    let cron = pipeline.config().schedule.cron.clone();
    let mut sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_pipeline = Arc::clone(&pipeline);
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&job_pipeline);
        Box::pin(async move {
            pipeline.run_scheduled_round().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
