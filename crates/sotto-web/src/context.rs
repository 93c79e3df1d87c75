//! Race-and-cancel aggregation of page content for one query.
//!
//! One search, then one concurrent fetch per result under a shared time
//! budget. The first `max_pages` pages with enough readable text win;
//! everything still in flight is dropped. Individual fetch failures are
//! swallowed, never fatal to the aggregation.

use crate::search::{extract_text, PageContent, SearchClient, SearchResult};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Returned when the search itself comes back empty (or fails outright).
pub const NO_RESULTS: &str = "No search results found.";

/// Knobs for one aggregation pass.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Stop once this many qualifying pages are collected.
    pub max_pages: usize,
    /// Pages with less readable text than this are rejected.
    pub min_page_chars: usize,
    /// Accepted page bodies are truncated to this many characters.
    pub max_page_chars: usize,
    /// Shared budget for the whole fetch fan-out.
    pub fetch_budget: Duration,
    /// Snippets used when no page qualifies.
    pub fallback_snippets: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_pages: 2,
            min_page_chars: 300,
            max_page_chars: 2000,
            fetch_budget: Duration::from_secs(4),
            fallback_snippets: 3,
        }
    }
}

/// Builds an LLM-ready context string from live web results.
pub struct SearchContextAggregator {
    client: Arc<dyn SearchClient>,
    config: ContextConfig,
}

impl SearchContextAggregator {
    pub fn new(client: Arc<dyn SearchClient>) -> Self {
        Self::with_config(client, ContextConfig::default())
    }

    pub fn with_config(client: Arc<dyn SearchClient>, config: ContextConfig) -> Self {
        Self { client, config }
    }

    /// Search, race the page fetches, and render whatever qualified.
    ///
    /// Never fails: search errors and empty result sets both yield the
    /// [`NO_RESULTS`] sentinel, and a fruitless fan-out falls back to the
    /// first few result snippets.
    pub async fn get_context(&self, query: &str) -> String {
        let results = match self.client.search(query).await {
            Ok(r) => r,
            Err(e) => {
                warn!("search failed for {query:?}: {e}");
                return NO_RESULTS.to_string();
            }
        };
        if results.is_empty() {
            return NO_RESULTS.to_string();
        }

        let pages = self.race_fetches(&results).await;
        if pages.is_empty() {
            debug!("no page qualified, falling back to snippets");
            return results
                .iter()
                .take(self.config.fallback_snippets)
                .enumerate()
                .map(|(i, r)| format!("{}. {}: {}", i + 1, r.title, r.snippet))
                .collect::<Vec<_>>()
                .join("\n");
        }

        pages
            .iter()
            .enumerate()
            .map(|(i, page)| format!("SOURCE {}: {}\n{}", i + 1, page.title, page.body))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Fan out one fetch per result; first `max_pages` qualifying pages win.
    /// Outstanding fetches are dropped once the quota or the budget is hit.
    async fn race_fetches(&self, results: &[SearchResult]) -> Vec<PageContent> {
        let mut fetches = FuturesUnordered::new();
        for result in results.iter().cloned() {
            let client = Arc::clone(&self.client);
            let min_chars = self.config.min_page_chars;
            let max_chars = self.config.max_page_chars;
            fetches.push(async move { qualify_page(client, result, min_chars, max_chars).await });
        }

        let mut pages = Vec::new();
        let quota = self.config.max_pages;
        let outcome = tokio::time::timeout(self.config.fetch_budget, async {
            while let Some(page) = fetches.next().await {
                if let Some(page) = page {
                    pages.push(page);
                    if pages.len() >= quota {
                        break;
                    }
                }
            }
        })
        .await;
        if outcome.is_err() {
            debug!(collected = pages.len(), "fetch budget elapsed");
        }
        drop(fetches);
        pages
    }
}

/// Fetch one result page and keep it only if enough readable text survives
/// boilerplate stripping. All per-page failures collapse to `None`.
async fn qualify_page(
    client: Arc<dyn SearchClient>,
    result: SearchResult,
    min_chars: usize,
    max_chars: usize,
) -> Option<PageContent> {
    let html = match client.fetch_page(&result.url).await {
        Ok(html) => html,
        Err(e) => {
            debug!("skipping {}: {e}", result.url);
            return None;
        }
    };
    let (title, text) = extract_text(&html);
    if text.chars().count() < min_chars {
        return None;
    }
    Some(PageContent {
        title: title.unwrap_or(result.title),
        url: result.url,
        body: text.chars().take(max_chars).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SearchError, WebResult};
    use std::collections::HashMap;

    /// Scripted client: fixed results, per-URL page behavior.
    struct FakeClient {
        results: Vec<SearchResult>,
        pages: HashMap<String, PageBehavior>,
    }

    enum PageBehavior {
        Body(String),
        Fail,
    }

    #[async_trait::async_trait]
    impl SearchClient for FakeClient {
        async fn search(&self, _query: &str) -> WebResult<Vec<SearchResult>> {
            Ok(self.results.clone())
        }

        async fn fetch_page(&self, url: &str) -> WebResult<String> {
            match self.pages.get(url) {
                Some(PageBehavior::Body(html)) => Ok(html.clone()),
                Some(PageBehavior::Fail) | None => Err(SearchError::Fetch {
                    url: url.to_string(),
                    reason: "scripted failure".to_string(),
                }),
            }
        }
    }

    fn result(n: usize) -> SearchResult {
        SearchResult {
            title: format!("Result {n}"),
            url: format!("https://example.com/{n}"),
            snippet: format!("snippet {n}"),
        }
    }

    fn long_page(marker: &str) -> String {
        format!(
            "<html><body><p>{} {}</p></body></html>",
            marker,
            "content word ".repeat(60)
        )
    }

    #[tokio::test]
    async fn empty_results_yield_sentinel() {
        let client = Arc::new(FakeClient {
            results: vec![],
            pages: HashMap::new(),
        });
        let agg = SearchContextAggregator::new(client);
        assert_eq!(agg.get_context("anything").await, NO_RESULTS);
    }

    #[tokio::test]
    async fn search_failure_yields_sentinel() {
        struct BrokenClient;
        #[async_trait::async_trait]
        impl SearchClient for BrokenClient {
            async fn search(&self, _query: &str) -> WebResult<Vec<SearchResult>> {
                Err(SearchError::Search("offline".to_string()))
            }
            async fn fetch_page(&self, _url: &str) -> WebResult<String> {
                unreachable!("search never succeeds")
            }
        }
        let agg = SearchContextAggregator::new(Arc::new(BrokenClient));
        assert_eq!(agg.get_context("anything").await, NO_RESULTS);
    }

    #[tokio::test]
    async fn falls_back_to_snippets_when_no_page_qualifies() {
        let mut pages = HashMap::new();
        // Too short to qualify.
        pages.insert(
            "https://example.com/1".to_string(),
            PageBehavior::Body("<html><body><p>tiny</p></body></html>".to_string()),
        );
        pages.insert("https://example.com/2".to_string(), PageBehavior::Fail);
        let client = Arc::new(FakeClient {
            results: vec![result(1), result(2), result(3), result(4)],
            pages,
        });
        let agg = SearchContextAggregator::new(client);
        let context = agg.get_context("query").await;
        assert!(context.starts_with("1. Result 1: snippet 1"));
        assert!(context.contains("3. Result 3: snippet 3"));
        // Capped at the first three snippets.
        assert!(!context.contains("Result 4"));
    }

    #[tokio::test]
    async fn accepted_bodies_are_truncated() {
        let mut pages = HashMap::new();
        pages.insert(
            "https://example.com/1".to_string(),
            PageBehavior::Body(long_page("verbose")),
        );
        let client = Arc::new(FakeClient {
            results: vec![result(1)],
            pages,
        });
        let config = ContextConfig {
            max_pages: 1,
            max_page_chars: 100,
            ..ContextConfig::default()
        };
        let agg = SearchContextAggregator::with_config(client, config);
        let context = agg.get_context("query").await;
        assert!(context.starts_with("SOURCE 1:"));
        let body = context.splitn(2, '\n').nth(1).unwrap();
        assert_eq!(body.chars().count(), 100);
    }
}
