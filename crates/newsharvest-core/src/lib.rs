//! Core domain model for the news harvest pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};
use url::{ParseError, Url};

pub const CRATE_NAME: &str = "newsharvest-core";

/// Version label used when a blocklist file name carries no `_v<version>` token.
pub const DEFAULT_FILTER_VERSION: &str = "v1.00";

pub type ArticleId = i64;

/// Crawl-lifecycle state persisted on every article record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Pending,
    UrlFiltered,
    Crawling,
    CrawlSuccess,
    CrawlFailed,
}

impl CrawlStatus {
    pub const ALL: [CrawlStatus; 5] = [
        CrawlStatus::Pending,
        CrawlStatus::UrlFiltered,
        CrawlStatus::Crawling,
        CrawlStatus::CrawlSuccess,
        CrawlStatus::CrawlFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Pending => "pending",
            CrawlStatus::UrlFiltered => "url_filtered",
            CrawlStatus::Crawling => "crawling",
            CrawlStatus::CrawlSuccess => "crawl_success",
            CrawlStatus::CrawlFailed => "crawl_failed",
        }
    }

    /// No transition out of these states happens inside the pipeline.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CrawlStatus::UrlFiltered | CrawlStatus::CrawlSuccess | CrawlStatus::CrawlFailed
        )
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown crawl status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for CrawlStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CrawlStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Normalized search hit ready for insertion with status `pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewArticle {
    pub url: String,
    pub title: String,
    pub pub_date: DateTime<Utc>,
    pub search_keyword: String,
    pub api_request_date: DateTime<Utc>,
}

/// Full persisted article row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub id: ArticleId,
    pub url: String,
    pub title: String,
    pub pub_date: DateTime<Utc>,
    pub search_keyword: String,
    pub api_request_date: DateTime<Utc>,
    pub crawl_status: CrawlStatus,
    pub url_filter_version: Option<String>,
    pub crawl_attempt_count: i32,
    pub crawl_claimed_at: Option<DateTime<Utc>>,
}

/// Pending row as seen by the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingArticle {
    pub id: ArticleId,
    pub url: String,
}

/// Vetted pending row selected for crawling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlTarget {
    pub id: ArticleId,
    pub url: String,
    pub title: String,
    pub pub_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawledContent {
    pub article_id: ArticleId,
    pub text: String,
    pub crawler_version: String,
    pub response_time_ms: i64,
    pub crawled_at: DateTime<Utc>,
}

/// Result of one classification pass, applied atomically by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub filter_version: String,
    pub filtered: Vec<ArticleId>,
    pub passed: Vec<ArticleId>,
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("reading blocklist {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Strip one leading `www.` from a host or blocklist entry.
pub fn normalize_domain(raw: &str) -> String {
    let trimmed = raw.trim().to_ascii_lowercase();
    match trimmed.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => trimmed,
    }
}

/// Normalized host of `url`, or `None` when the URL does not parse or has no host.
///
/// Schemeless links such as `example.com/story` are retried as `https://`.
pub fn url_host(url: &str) -> Option<String> {
    let url = url.trim();
    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("https://{url}")).ok()?,
        Err(_) => return None,
    };
    let host = parsed.host_str()?;
    if host.is_empty() {
        return None;
    }
    Some(normalize_domain(host))
}

/// Domain blocklist loaded once per classification pass.
///
/// Matching is a loose bidirectional substring test: a host matches when it
/// contains an entry or an entry contains it. `news.naver.com` matches the
/// entry `naver.com`, and `naver.com` matches the entry `m.naver.com`. Short
/// fragments can therefore over-match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSet {
    version: String,
    domains: BTreeSet<String>,
}

impl FilterSet {
    pub fn new<I, S>(version: impl Into<String>, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| normalize_domain(d.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();
        Self {
            version: version.into(),
            domains,
        }
    }

    /// One domain per line; blank lines are ignored.
    pub fn parse(version: impl Into<String>, text: &str) -> Self {
        Self::new(version, text.lines())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FilterError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| FilterError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let set = Self::parse(Self::version_from_path(path), &text);
        info!(
            domains = set.len(),
            version = %set.version,
            path = %path.display(),
            "loaded filter domains"
        );
        Ok(set)
    }

    /// Like [`FilterSet::load`], but an unreadable file becomes an empty set
    /// that still carries the file's version label.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(set) => set,
            Err(err) => {
                error!(error = %err, "failed to load filter file; continuing with empty blocklist");
                Self::new(Self::version_from_path(path), std::iter::empty::<&str>())
            }
        }
    }

    /// `filter_domain_list_v1.00.txt` -> `v1.00`.
    pub fn version_from_path(path: impl AsRef<Path>) -> String {
        let file_name = path
            .as_ref()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match file_name.rsplit_once("_v") {
            Some((_, version)) => {
                let version = version.strip_suffix(".txt").unwrap_or(version);
                if version.is_empty() {
                    DEFAULT_FILTER_VERSION.to_string()
                } else {
                    format!("v{version}")
                }
            }
            None => DEFAULT_FILTER_VERSION.to_string(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// An empty host is contained in every entry, so it matches any non-empty blocklist.
    pub fn matches_host(&self, host: &str) -> bool {
        let host = normalize_domain(host);
        self.domains
            .iter()
            .any(|entry| host.contains(entry.as_str()) || entry.contains(host.as_str()))
    }

    /// URLs without a recoverable host are matched as an empty host.
    pub fn matches_url(&self, url: &str) -> bool {
        self.matches_host(&url_host(url).unwrap_or_default())
    }

    pub fn classify(&self, candidates: &[PendingArticle]) -> Classification {
        let mut out = Classification {
            filter_version: self.version.clone(),
            ..Default::default()
        };
        for candidate in candidates {
            if self.matches_url(&candidate.url) {
                out.filtered.push(candidate.id);
            } else {
                out.passed.push(candidate.id);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn status_strings_match_store_values() {
        assert_eq!(CrawlStatus::UrlFiltered.as_str(), "url_filtered");
        assert_eq!("crawl_success".parse::<CrawlStatus>(), Ok(CrawlStatus::CrawlSuccess));
        assert_eq!(
            "done".parse::<CrawlStatus>(),
            Err(UnknownStatus("done".to_string()))
        );
        assert!(!CrawlStatus::Crawling.is_terminal());
        assert!(CrawlStatus::CrawlFailed.is_terminal());
    }

    #[test]
    fn subdomain_host_matches_parent_entry() {
        let filters = FilterSet::new("v1", ["naver.com"]);
        assert!(filters.matches_url("https://news.naver.com/article/1"));
    }

    #[test]
    fn host_contained_in_entry_matches() {
        let filters = FilterSet::new("v1", ["m.naver.com"]);
        assert!(filters.matches_url("https://naver.com/a"));
        assert!(filters.matches_url("https://www.naver.com/a"));
    }

    #[test]
    fn unrelated_url_passes() {
        let filters = FilterSet::new("v1", ["blocked.com"]);
        assert!(!filters.matches_url("https://example.org/story"));
    }

    #[test]
    fn schemeless_link_uses_its_real_host() {
        let filters = FilterSet::new("v1", ["blocked.com"]);
        assert_eq!(url_host("blocked.com/story").as_deref(), Some("blocked.com"));
        assert!(filters.matches_url("blocked.com/story"));
        assert!(!filters.matches_url("example.org/story"));
    }

    #[test]
    fn hostless_urls_match_any_non_empty_blocklist() {
        let filters = FilterSet::new("v1", ["blocked.com"]);
        assert!(filters.matches_url("not a url"));
        assert!(filters.matches_url("mailto:someone@elsewhere.org"));
        assert!(filters.matches_url(""));

        let empty = FilterSet::new("v1", std::iter::empty::<&str>());
        assert!(!empty.matches_url("not a url"));
        assert!(!empty.matches_url("mailto:someone@elsewhere.org"));
    }

    #[test]
    fn entries_are_normalized_on_load() {
        let filters = FilterSet::parse("v2", "  www.Blocked.com \n\n sub.other.kr\n");
        assert_eq!(filters.len(), 2);
        assert!(filters.matches_host("blocked.com"));
        assert!(filters.matches_host("www.sub.other.kr"));
    }

    #[test]
    fn classify_partitions_ids() {
        let filters = FilterSet::new("v1.00", ["blocked.com"]);
        let candidates = vec![
            PendingArticle { id: 3, url: "https://sub.blocked.com/x".into() },
            PendingArticle { id: 2, url: "https://fine.co.kr/y".into() },
            PendingArticle { id: 1, url: "::".into() },
        ];
        let result = filters.classify(&candidates);
        assert_eq!(result.filter_version, "v1.00");
        assert_eq!(result.filtered, vec![3]);
        assert_eq!(result.passed, vec![2, 1]);
    }

    #[test]
    fn version_is_taken_from_file_name() {
        assert_eq!(
            FilterSet::version_from_path("filters/filter_domain_list_v1.00.txt"),
            "v1.00"
        );
        assert_eq!(FilterSet::version_from_path("/srv/my_vault/blocklist_v2.txt"), "v2");
        assert_eq!(FilterSet::version_from_path("blocklist.txt"), DEFAULT_FILTER_VERSION);
    }

    #[test]
    fn load_reads_file_and_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("domains_v3.10.txt");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(file, "www.spam.com\nads.example.net").expect("write");
        drop(file);

        let loaded = FilterSet::load(&path).expect("load");
        assert_eq!(loaded.version(), "v3.10");
        assert_eq!(loaded.len(), 2);

        let missing = FilterSet::load_or_empty(dir.path().join("gone_v9.txt"));
        assert!(missing.is_empty());
        assert_eq!(missing.version(), "v9");
    }
}
