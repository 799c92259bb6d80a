use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use newsharvest_core::CrawlStatus;
use newsharvest_pipeline::{run_scheduler, NewsPipeline, PipelineConfig, DEFAULT_KEYWORD, DEFAULT_TARGET};
use newsharvest_storage::PgArticleStore;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "newsharvest")]
#[command(about = "News search harvest, URL filtering and full-text crawl")]
struct Cli {
    /// Print run summaries as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Page through the search API for a keyword and store unseen articles.
    Harvest {
        #[arg(long, default_value = DEFAULT_KEYWORD)]
        keyword: String,
        #[arg(long, default_value_t = DEFAULT_TARGET)]
        target: usize,
    },
    /// Stamp pending articles with the blocklist version.
    Classify,
    /// Classify, then crawl every eligible article.
    Crawl,
    /// Run the harvest jobs now and on the configured cron until Ctrl-C.
    Schedule,
    Migrate,
    /// Return articles stuck in `crawling` to `pending`.
    Sweep {
        #[arg(long, default_value_t = 60)]
        older_than_minutes: i64,
    },
    /// Article counts per crawl status.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Harvest {
        keyword: DEFAULT_KEYWORD.to_string(),
        target: DEFAULT_TARGET,
    });

    tracing::debug!(?command, "dispatching");

    if let Commands::Migrate = command {
        let store = PgArticleStore::connect(&config.store)
            .await
            .context("connecting to postgres")?;
        store.migrate().await.context("applying migrations")?;
        println!("migrations applied");
        return Ok(());
    }

    let pipeline = NewsPipeline::connect(config).await?;
    match command {
        Commands::Harvest { keyword, target } => {
            let summary = pipeline.harvester()?.harvest(&keyword, target).await?;
            if cli.json {
                return print_json(&summary);
            }
            println!(
                "harvest complete: run_id={} keyword={} collected={} inserted={} stop={:?}",
                summary.run_id, summary.keyword, summary.collected, summary.inserted, summary.stop_reason
            );
        }
        Commands::Classify => {
            let summary = pipeline.classifier().classify().await?;
            if cli.json {
                return print_json(&summary);
            }
            println!(
                "classify complete: version={} examined={} filtered={} passed={}",
                summary.filter_version, summary.examined, summary.filtered, summary.passed
            );
        }
        Commands::Crawl => {
            let summary = pipeline.crawler().run().await?;
            if cli.json {
                return print_json(&summary);
            }
            println!(
                "crawl complete: filtered={} succeeded={} failed={} elapsed={:.2}s",
                summary.filtered, summary.succeeded, summary.failed, summary.elapsed_secs
            );
        }
        Commands::Schedule => {
            run_scheduler(Arc::new(pipeline)).await?;
        }
        Commands::Sweep { older_than_minutes } => {
            let cutoff = sweep_cutoff(Utc::now(), older_than_minutes)?;
            let released = pipeline
                .store()
                .release_stuck_crawling(cutoff)
                .await
                .context("releasing stuck crawls")?;
            println!("released {released} article(s) claimed before {cutoff}");
        }
        Commands::Status => {
            let counts = pipeline.store().status_counts().await.context("counting articles")?;
            let rows: BTreeMap<&str, i64> = CrawlStatus::ALL
                .iter()
                .map(|status| {
                    let count = counts
                        .iter()
                        .find(|(s, _)| s == status)
                        .map(|(_, n)| *n)
                        .unwrap_or(0);
                    (status.as_str(), count)
                })
                .collect();
            if cli.json {
                return print_json(&rows);
            }
            for status in CrawlStatus::ALL {
                println!("{:<14} {}", status.as_str(), rows.get(status.as_str()).copied().unwrap_or(0));
            }
        }
        Commands::Migrate => {}
    }

    Ok(())
}

/// Claims older than this instant are released; out-of-range ages are rejected.
fn sweep_cutoff(now: DateTime<Utc>, older_than_minutes: i64) -> Result<DateTime<Utc>> {
    Duration::try_minutes(older_than_minutes.max(0))
        .and_then(|age| now.checked_sub_signed(age))
        .with_context(|| format!("--older-than-minutes {older_than_minutes} is out of range"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing summary")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sweep_cutoff_subtracts_minutes() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        assert_eq!(
            sweep_cutoff(now, 90).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 30, 0).single().unwrap()
        );
        assert_eq!(sweep_cutoff(now, -5).unwrap(), now);
    }

    #[test]
    fn sweep_cutoff_rejects_huge_ages() {
        let err = sweep_cutoff(Utc::now(), i64::MAX).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn sweep_arguments_parse() {
        let cli = Cli::try_parse_from(["newsharvest", "sweep", "--older-than-minutes", "15"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Sweep { older_than_minutes: 15 })));
    }
}
