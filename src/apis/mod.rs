pub mod arxiv;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;

use crate::ratelimit::RateLimiter;

/// A paper as stored in the paper store. `id` never changes once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperRecord {
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub date: Option<NaiveDate>,
    pub abstract_text: String,
    #[serde(default)]
    pub sections: BTreeMap<String, String>,
    #[serde(default)]
    pub citations: Vec<CitationEntry>,
}

impl PaperRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>, authors: Vec<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            authors,
            date: None,
            abstract_text: String::new(),
            sections: BTreeMap::new(),
            citations: Vec::new(),
        }
    }
}

/// A bibliography entry confirmed to be cited from the paper's source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationEntry {
    pub key: String,
    pub entry_type: String,
    pub fields: BTreeMap<String, String>,
}

impl CitationEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Archive error: {0}")]
    Archive(String),
}

/// External capabilities the crawler depends on. Implementations do not rate limit
/// themselves; callers acquire a slot on the shared [`RateLimiter`] before every call.
#[async_trait]
pub trait PaperSource: Send + Sync {
    fn name(&self) -> &str;

    /// One page of an author's papers, metadata only, starting at offset `start`.
    async fn fetch_author_page(
        &self,
        author: &str,
        start: u32,
        page_size: u32,
    ) -> Result<Vec<PaperRecord>, SourceError>;

    async fn fetch_paper_metadata(&self, id: &str) -> Result<Option<PaperRecord>, SourceError>;

    async fn fetch_author_paper_count(&self, author: &str) -> Result<u64, SourceError>;

    /// Download and unpack the source archive of `id`. The returned directory is
    /// removed when dropped.
    async fn fetch_paper_source(&self, id: &str) -> Result<TempDir, SourceError>;
}

/// Collect up to `max_results` papers for `author`, one rate-limited request per page.
/// Stops at the first empty or short page.
pub async fn fetch_author_papers(
    source: &dyn PaperSource,
    limiter: &RateLimiter,
    author: &str,
    max_results: u32,
    page_size: u32,
) -> Result<Vec<PaperRecord>, SourceError> {
    let page_size = page_size.max(1);
    let mut papers = Vec::new();
    let mut start = 0u32;

    while (papers.len() as u32) < max_results {
        let want = page_size.min(max_results - papers.len() as u32);
        limiter.acquire().await;
        let page = source.fetch_author_page(author, start, want).await?;
        let got = page.len() as u32;
        tracing::debug!("{}: page at {} for {} returned {} papers", source.name(), start, author, got);
        if got == 0 {
            break;
        }
        papers.extend(page);
        if got < want {
            break;
        }
        start += got;
    }

    papers.truncate(max_results as usize);
    Ok(papers)
}


#[cfg(test)]
mod tests {
    use super::testing::{paper, MockSource};
    use super::*;
    use std::time::Duration;

    fn limiter() -> RateLimiter {
        RateLimiter::new(100, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_pagination_stops_on_short_page() {
        let mut source = MockSource::default();
        source.listings.insert(
            "A".into(),
            (0..5).map(|i| paper(&format!("p{}", i), &["A"])).collect(),
        );

        let papers = fetch_author_papers(&source, &limiter(), "A", 100, 2).await.unwrap();
        assert_eq!(papers.len(), 5);
        assert_eq!(source.calls(), vec!["page:A:0", "page:A:2", "page:A:4"]);
    }

    #[tokio::test]
    async fn test_pagination_stops_on_empty_page() {
        let mut source = MockSource::default();
        source.listings.insert(
            "A".into(),
            (0..4).map(|i| paper(&format!("p{}", i), &["A"])).collect(),
        );

        let papers = fetch_author_papers(&source, &limiter(), "A", 100, 2).await.unwrap();
        assert_eq!(papers.len(), 4);
        assert_eq!(source.calls(), vec!["page:A:0", "page:A:2", "page:A:4"]);
    }

    #[tokio::test]
    async fn test_pagination_respects_max_results() {
        let mut source = MockSource::default();
        source.listings.insert(
            "A".into(),
            (0..10).map(|i| paper(&format!("p{}", i), &["A"])).collect(),
        );

        let papers = fetch_author_papers(&source, &limiter(), "A", 3, 2).await.unwrap();
        let ids: Vec<_> = papers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p0", "p1", "p2"]);
    }

    #[tokio::test]
    async fn test_pagination_propagates_fetch_error() {
        let source = MockSource {
            failing_authors: vec!["A".into()],
            ..Default::default()
        };
        let err = fetch_author_papers(&source, &limiter(), "A", 10, 5).await.unwrap_err();
        assert!(matches!(err, SourceError::Status { status: 503, .. }));
    }
}
