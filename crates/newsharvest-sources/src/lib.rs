//! External collaborators: the news search provider and the article extractor.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT_LANGUAGE;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "newsharvest-sources";

pub const NAVER_NEWS_ENDPOINT: &str = "https://openapi.naver.com/v1/search/news.json";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);

        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        builder.build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Newest first.
    Date,
}

impl SortOrder {
    fn as_param(&self) -> &'static str {
        match self {
            SortOrder::Date => "date",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    /// Page size, at most 100.
    pub display: u32,
    /// 1-based offset of the first result.
    pub start: u32,
    pub sort: SortOrder,
}

/// One search hit in the provider's wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchItem {
    /// May contain inline markup such as `<b>`.
    pub title: String,
    pub link: String,
    /// RFC-822 style, e.g. `Mon, 03 Mar 2026 09:15:00 +0900`.
    #[serde(rename = "pubDate")]
    pub pub_date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub items: Vec<SearchItem>,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from search provider")]
    HttpStatus { status: u16 },
    #[error("search credentials are not configured")]
    MissingCredentials,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, SearchError>;
}

#[derive(Debug, Clone)]
pub struct SearchApiConfig {
    pub endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    pub http: HttpClientConfig,
}

impl Default for SearchApiConfig {
    fn default() -> Self {
        Self {
            endpoint: NAVER_NEWS_ENDPOINT.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            http: HttpClientConfig::default(),
        }
    }
}

/// Naver news search client authenticated with a client id/secret header pair.
#[derive(Debug, Clone)]
pub struct NaverNewsClient {
    client: reqwest::Client,
    config: SearchApiConfig,
}

impl NaverNewsClient {
    pub fn new(config: SearchApiConfig) -> Result<Self, SearchError> {
        if config.client_id.is_empty() || config.client_secret.is_empty() {
            return Err(SearchError::MissingCredentials);
        }
        let client = config.http.build_client()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl SearchProvider for NaverNewsClient {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, SearchError> {
        let display = request.display.to_string();
        let start = request.start.to_string();
        let resp = self
            .client
            .get(&self.config.endpoint)
            .header("X-Naver-Client-Id", &self.config.client_id)
            .header("X-Naver-Client-Secret", &self.config.client_secret)
            .query(&[
                ("query", request.query.as_str()),
                ("display", display.as_str()),
                ("start", start.as_str()),
                ("sort", request.sort.as_param()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SearchError::HttpStatus {
                status: status.as_u16(),
            });
        }
        let page: SearchPage = resp.json().await?;
        debug!(items = page.items.len(), start = request.start, "search page received");
        Ok(page)
    }
}

/// Drops inline markup from a search title and decodes entities.
pub fn strip_markup(raw: &str) -> String {
    let fragment = Html::parse_fragment(raw);
    fragment.root_element().text().collect::<String>().trim().to_string()
}

pub fn parse_pub_date(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc2822(raw.trim()).map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("article request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Downloads an article and returns its plain body text.
///
/// `Ok(None)` means the page was fetched but no text could be extracted.
#[async_trait]
pub trait ArticleExtractor: Send + Sync {
    async fn extract(&self, url: &str, language: &str) -> Result<Option<String>, ExtractError>;
}

#[derive(Debug, Clone)]
pub struct HtmlArticleExtractor {
    client: reqwest::Client,
}

impl HtmlArticleExtractor {
    pub fn new(config: &HttpClientConfig) -> Result<Self, ExtractError> {
        Ok(Self {
            client: config.build_client()?,
        })
    }
}

#[async_trait]
impl ArticleExtractor for HtmlArticleExtractor {
    async fn extract(&self, url: &str, language: &str) -> Result<Option<String>, ExtractError> {
        let resp = self
            .client
            .get(url)
            .header(ACCEPT_LANGUAGE, language)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ExtractError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let html = resp.text().await?;
        let text = extract_body_text(&html);
        Ok(if text.is_empty() { None } else { Some(text) })
    }
}

// Most specific first; Naver-hosted articles keep their body in #dic_area.
const BODY_CONTAINERS: [&str; 4] = ["#dic_area", "#articleBodyContents", "#newsct_article", "article"];

/// Body text of an article page, paragraphs separated by blank lines.
///
/// Falls back to the whole `body` text when no container or paragraph has any.
pub fn extract_body_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let Ok(paragraph) = Selector::parse("p") else {
        return String::new();
    };

    for css in BODY_CONTAINERS {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        let Some(container) = document.select(&selector).next() else {
            continue;
        };
        let paragraphs = collect_blocks(container.select(&paragraph));
        let text = if paragraphs.is_empty() {
            normalize_whitespace(container)
        } else {
            paragraphs
        };
        if !text.is_empty() {
            return text;
        }
    }

    let paragraphs = collect_blocks(document.select(&paragraph));
    if !paragraphs.is_empty() {
        return paragraphs;
    }

    let Ok(body) = Selector::parse("body") else {
        return String::new();
    };
    document
        .select(&body)
        .next()
        .map(normalize_whitespace)
        .unwrap_or_default()
}

fn collect_blocks<'a>(elements: impl Iterator<Item = ElementRef<'a>>) -> String {
    elements
        .map(normalize_whitespace)
        .filter(|block| !block.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn normalize_whitespace(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
