use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::apis::arxiv::ArxivClient;
use crate::apis::PaperSource;
use crate::crawl::frontier::FrontierMode;
use crate::crawl::{CrawlContext, CrawlSettings};
use crate::ratelimit::RateLimiter;
use crate::store::checkpoint::CheckpointStore;
use crate::store::PaperStore;

/// Crawler configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub rate_max_calls: usize,
    pub rate_period: Duration,
    pub crawl: CrawlSettings,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Values that fail to parse are logged and replaced by their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = lookup("LITCRAWL_DATA_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir(&lookup).join(".litcrawl"));

        let defaults = CrawlSettings::default();
        let crawl = CrawlSettings {
            mode: parse_or(&lookup, "LITCRAWL_FRONTIER", defaults.mode),
            max_authors: lookup("LITCRAWL_MAX_AUTHORS").and_then(|raw| match raw.trim().parse::<usize>() {
                Ok(n) => Some(n),
                Err(_) => {
                    tracing::warn!("Ignoring LITCRAWL_MAX_AUTHORS={:?}: not a number", raw);
                    None
                }
            }),
            max_papers_per_author: parse_or(&lookup, "LITCRAWL_MAX_PAPERS", defaults.max_papers_per_author),
            page_size: parse_or(&lookup, "LITCRAWL_PAGE_SIZE", defaults.page_size).max(1),
            ingest_concurrency: parse_or(&lookup, "LITCRAWL_INGEST_CONCURRENCY", defaults.ingest_concurrency).max(1),
            fetch_sources: parse_or(&lookup, "LITCRAWL_FETCH_SOURCES", defaults.fetch_sources),
        };

        Self {
            data_dir,
            rate_max_calls: parse_or(&lookup, "LITCRAWL_RATE_MAX_CALLS", 1usize).max(1),
            rate_period: Duration::from_millis(parse_or(&lookup, "LITCRAWL_RATE_PERIOD_MS", 3000u64)),
            crawl,
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("lance")
    }

    /// One limiter per process; every request to the source goes through it.
    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(self.rate_max_calls, self.rate_period))
    }

    pub fn build_source(&self) -> Result<Arc<dyn PaperSource>> {
        let client = ArxivClient::new().context("Failed to build arXiv HTTP client")?;
        Ok(Arc::new(client))
    }

    /// Open the paper store and checkpoint location under `data_dir` and wire them
    /// to a fresh source and rate limiter.
    pub async fn open_context(&self, settings: CrawlSettings) -> Result<CrawlContext> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Failed to create data dir {}", self.data_dir.display()))?;
        let store = PaperStore::create_or_open(&self.store_dir()).await?;
        tracing::info!("Opened paper store at {}", self.store_dir().display());
        Ok(CrawlContext {
            source: self.build_source()?,
            limiter: self.rate_limiter(),
            store: Arc::new(store),
            checkpoints: CheckpointStore::new(&self.data_dir),
            settings,
        })
    }

    /// Crawl settings with per-invocation overrides applied.
    pub fn crawl_settings(&self, mode: Option<FrontierMode>, max_authors: Option<usize>) -> CrawlSettings {
        let mut settings = self.crawl.clone();
        if let Some(mode) = mode {
            settings.mode = mode;
        }
        if max_authors.is_some() {
            settings.max_authors = max_authors;
        }
        settings
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring {}={:?}: invalid value, using default", key, raw);
            default
        }),
    }
}

fn home_dir<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}
