//! DuckDuckGo HTML search and raw page fetch.
//!
//! Uses the no-JavaScript HTML endpoint so results can be scraped with plain
//! CSS selectors. Page fetches return raw HTML; boilerplate stripping happens
//! in [`extract_text`] so the aggregator can judge pages after the fact.

use crate::error::{SearchError, WebResult};
use scraper::{ElementRef, Html, Node, Selector};
use std::time::Duration;
use tracing::debug;

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";

/// Browser-like User-Agent; the HTML endpoint rejects obvious bots.
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Elements whose text is never article content.
const JUNK_TAGS: [&str; 7] = [
    "script", "style", "nav", "footer", "header", "aside", "noscript",
];

/// One search hit: title, destination URL, and the engine's snippet.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// A fetched page reduced to readable text, capped by the aggregator.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PageContent {
    pub title: String,
    pub url: String,
    pub body: String,
}

/// Search engine + page fetcher consumed by the aggregator.
#[async_trait::async_trait]
pub trait SearchClient: Send + Sync {
    /// Run one search; an empty vec means "no results", not an error.
    async fn search(&self, query: &str) -> WebResult<Vec<SearchResult>>;

    /// Fetch one result page as raw HTML. Non-200 statuses are errors.
    async fn fetch_page(&self, url: &str) -> WebResult<String>;
}

/// DuckDuckGo HTML search client.
pub struct DuckDuckGoClient {
    client: reqwest::Client,
    max_results: usize,
}

impl DuckDuckGoClient {
    /// Build a client with a browser UA and a per-request timeout.
    pub fn new() -> WebResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            max_results: 5,
        })
    }

    /// Cap the number of parsed search results (default 5).
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }
}

#[async_trait::async_trait]
impl SearchClient for DuckDuckGoClient {
    async fn search(&self, query: &str) -> WebResult<Vec<SearchResult>> {
        let url = reqwest::Url::parse_with_params(SEARCH_ENDPOINT, &[("q", query)])
            .map_err(|e| SearchError::Search(e.to_string()))?;
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SearchError::Search(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            return Err(SearchError::Status {
                url: SEARCH_ENDPOINT.to_string(),
                status: status.as_u16(),
            });
        }
        let html = res
            .text()
            .await
            .map_err(|e| SearchError::Search(e.to_string()))?;
        let results = parse_results(&html, self.max_results);
        debug!(query, count = results.len(), "search complete");
        Ok(results)
    }

    async fn fetch_page(&self, url: &str) -> WebResult<String> {
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SearchError::Fetch {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let status = res.status();
        if !status.is_success() {
            return Err(SearchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        res.text().await.map_err(|e| SearchError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Extract `{title, url, snippet}` rows from a DuckDuckGo HTML results page.
pub fn parse_results(html: &str, max_results: usize) -> Vec<SearchResult> {
    let doc = Html::parse_document(html);
    let result_sel = Selector::parse("div.result").unwrap_or_else(|_| unreachable!());
    let title_sel = Selector::parse("a.result__a").unwrap_or_else(|_| unreachable!());
    let snippet_sel = Selector::parse("a.result__snippet").unwrap_or_else(|_| unreachable!());

    doc.select(&result_sel)
        .take(max_results)
        .filter_map(|result| {
            let title = result.select(&title_sel).next()?;
            let snippet = result.select(&snippet_sel).next()?;
            let url = title.value().attr("href")?.trim().to_string();
            if url.is_empty() {
                return None;
            }
            Some(SearchResult {
                title: squash_whitespace(&title.text().collect::<String>()),
                url,
                snippet: squash_whitespace(&snippet.text().collect::<String>()),
            })
        })
        .collect()
}

/// Reduce a page to `(title, readable text)`: drops script/style/nav/chrome
/// subtrees and collapses all whitespace runs to single spaces.
pub fn extract_text(html: &str) -> (Option<String>, String) {
    let doc = Html::parse_document(html);
    let title_sel = Selector::parse("title").unwrap_or_else(|_| unreachable!());
    let title = doc
        .select(&title_sel)
        .next()
        .map(|el| squash_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty());

    let body_sel = Selector::parse("body").unwrap_or_else(|_| unreachable!());
    let mut text = String::new();
    if let Some(body) = doc.select(&body_sel).next() {
        collect_readable_text(body, &mut text);
    }
    (title, squash_whitespace(&text))
}

fn collect_readable_text(element: ElementRef, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(t) => {
                out.push_str(&t.text);
                out.push(' ');
            }
            Node::Element(el) => {
                if JUNK_TAGS.contains(&el.name()) {
                    continue;
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_readable_text(child_el, out);
                }
            }
            _ => {}
        }
    }
}

fn squash_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
