pub mod frontier;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::apis::{fetch_author_papers, PaperRecord, PaperSource};
use crate::ingest::SourceIngestor;
use crate::ratelimit::RateLimiter;
use crate::store::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::store::PaperStore;
use frontier::{EmptyFrontier, Frontier, FrontierMode};

/// Seeds jump ahead of discovered authors in priority mode.
const SEED_SCORE: i64 = i64::MAX;

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub mode: FrontierMode,
    /// Authors to process in one run; `None` runs until the frontier drains.
    pub max_authors: Option<usize>,
    pub max_papers_per_author: u32,
    pub page_size: u32,
    pub ingest_concurrency: usize,
    pub fetch_sources: bool,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            mode: FrontierMode::Fifo,
            max_authors: None,
            max_papers_per_author: 200,
            page_size: 100,
            ingest_concurrency: 4,
            fetch_sources: true,
        }
    }
}

/// Handles shared by everything a run touches. Built once per run.
#[derive(Clone)]
pub struct CrawlContext {
    pub source: Arc<dyn PaperSource>,
    pub limiter: Arc<RateLimiter>,
    pub store: Arc<PaperStore>,
    pub checkpoints: CheckpointStore,
    pub settings: CrawlSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlOutcome {
    /// The frontier ran empty.
    Drained,
    /// Stopped after `max_authors` authors.
    BudgetExhausted,
    /// Stopped on request between steps.
    Interrupted,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StepReport {
    pub author: String,
    pub fetched: usize,
    pub fetch_failed: bool,
    pub inserted: usize,
    pub duplicates: usize,
    pub enqueued: Vec<String>,
}

#[derive(Debug)]
pub enum StepOutcome {
    Processed(StepReport),
    Drained,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlSummary {
    pub outcome: CrawlOutcome,
    pub authors_processed: usize,
    pub papers_inserted: usize,
    pub steps_completed: u64,
    pub queued: usize,
    pub visited: usize,
}

/// Single-threaded crawl loop over the author frontier.
///
/// One author is fetched, ingested, persisted, expanded and checkpointed before the
/// next is dequeued. If a step fails half way its author is still queued in the last
/// checkpoint, so resuming repeats that step only.
pub struct Crawler {
    ctx: CrawlContext,
    ingestor: SourceIngestor,
    frontier: Frontier,
    steps_completed: u64,
    stop: Arc<AtomicBool>,
}

impl Crawler {
    /// Restore crawl state from the checkpoint, or start empty on first run.
    pub fn resume(ctx: CrawlContext) -> Result<Self, CheckpointError> {
        let (frontier, steps_completed) = match ctx.checkpoints.load()? {
            Some(checkpoint) => {
                if checkpoint.frontier.mode != ctx.settings.mode {
                    tracing::warn!(
                        "Checkpoint uses {} frontier, ignoring configured {}",
                        checkpoint.frontier.mode,
                        ctx.settings.mode
                    );
                }
                let steps = checkpoint.steps_completed;
                let frontier = checkpoint.into_frontier();
                tracing::info!(
                    "Resuming crawl after {} steps: {} queued, {} visited",
                    steps,
                    frontier.len(),
                    frontier.visited_count()
                );
                (frontier, steps)
            }
            None => (Frontier::new(ctx.settings.mode), 0),
        };

        let ingestor = SourceIngestor::new(ctx.source.clone(), ctx.limiter.clone());
        Ok(Self {
            ctx,
            ingestor,
            frontier,
            steps_completed,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Queue a seed author and checkpoint it. No-op if already queued or visited.
    pub fn seed(&mut self, author: &str) -> Result<bool, CheckpointError> {
        if !self.frontier.enqueue(author.trim(), SEED_SCORE) {
            tracing::info!("Seed {} is already queued or visited", author);
            return Ok(false);
        }
        self.ctx
            .checkpoints
            .save(&Checkpoint::capture(&self.frontier, self.steps_completed))?;
        Ok(true)
    }

    /// Setting the flag stops the loop before the next step starts.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    pub fn steps_completed(&self) -> u64 {
        self.steps_completed
    }

    /// Run steps until the frontier drains, the author budget is spent, or a stop is requested.
    pub async fn run(&mut self) -> Result<CrawlSummary> {
        let mut authors_processed = 0usize;
        let mut papers_inserted = 0usize;

        let outcome = loop {
            if self.stop.load(Ordering::SeqCst) {
                break CrawlOutcome::Interrupted;
            }
            if self
                .ctx
                .settings
                .max_authors
                .is_some_and(|max| authors_processed >= max)
            {
                break CrawlOutcome::BudgetExhausted;
            }
            match self.step().await? {
                StepOutcome::Drained => break CrawlOutcome::Drained,
                StepOutcome::Processed(report) => {
                    authors_processed += 1;
                    papers_inserted += report.inserted;
                }
            }
        };

        let summary = CrawlSummary {
            outcome,
            authors_processed,
            papers_inserted,
            steps_completed: self.steps_completed,
            queued: self.frontier.len(),
            visited: self.frontier.visited_count(),
        };
        tracing::info!(
            "Crawl finished ({:?}): {} authors, {} new papers, {} queued",
            summary.outcome,
            summary.authors_processed,
            summary.papers_inserted,
            summary.queued
        );
        Ok(summary)
    }

    /// Process one author end to end.
    pub async fn step(&mut self) -> Result<StepOutcome> {
        let author = match self.frontier.dequeue() {
            Ok(author) => author,
            Err(EmptyFrontier) => return Ok(StepOutcome::Drained),
        };
        tracing::info!(
            "Crawling {} ({} queued, {} visited)",
            author,
            self.frontier.len(),
            self.frontier.visited_count()
        );
        let mut report = StepReport { author: author.clone(), ..Default::default() };

        let settings = &self.ctx.settings;
        let papers = match fetch_author_papers(
            self.ctx.source.as_ref(),
            &self.ctx.limiter,
            &author,
            settings.max_papers_per_author,
            settings.page_size,
        )
        .await
        {
            Ok(papers) => papers,
            Err(e) => {
                // No retry: the author is still marked visited below.
                tracing::warn!("Fetching papers of {} failed: {}", author, e);
                report.fetch_failed = true;
                Vec::new()
            }
        };
        report.fetched = papers.len();

        let collaborators = collaborators_of(&author, &papers);
        let fresh = self.ingest_new(papers).await?;
        let inserted = self.ctx.store.bulk_insert(&fresh).await?;
        report.inserted = inserted.inserted.len();
        report.duplicates = inserted.duplicates.len();

        for name in collaborators {
            if !self.frontier.is_new(&name) {
                continue;
            }
            let score = self.score(&name).await;
            if self.frontier.enqueue(&name, score) {
                report.enqueued.push(name);
            }
        }

        self.frontier.mark_visited(&author);
        self.steps_completed += 1;
        self.ctx
            .checkpoints
            .save(&Checkpoint::capture(&self.frontier, self.steps_completed))?;

        tracing::info!(
            "Finished {}: {} fetched, {} stored, {} new collaborators queued",
            author,
            report.fetched,
            report.inserted,
            report.enqueued.len()
        );
        Ok(StepOutcome::Processed(report))
    }

    /// Papers not yet stored, enriched from their sources by concurrent workers.
    async fn ingest_new(&self, papers: Vec<PaperRecord>) -> Result<Vec<PaperRecord>> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for paper in papers {
            if !seen.insert(paper.id.clone()) {
                continue;
            }
            // Fast path only; bulk_insert makes the final call on duplicates.
            if self.ctx.store.exists(&paper.id).await? {
                continue;
            }
            candidates.push(paper);
        }

        if !self.ctx.settings.fetch_sources || candidates.is_empty() {
            return Ok(candidates);
        }

        let ingestor = &self.ingestor;
        let enriched = stream::iter(candidates)
            .map(|mut paper| async move {
                ingestor.ingest(&paper.id).await.merge_into(&mut paper);
                paper
            })
            .buffer_unordered(self.ctx.settings.ingest_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        Ok(enriched)
    }

    async fn score(&self, author: &str) -> i64 {
        match self.frontier.mode() {
            FrontierMode::Fifo => 0,
            FrontierMode::Priority => {
                self.ctx.limiter.acquire().await;
                match self.ctx.source.fetch_author_paper_count(author).await {
                    Ok(count) => i64::try_from(count).unwrap_or(i64::MAX - 1),
                    Err(e) => {
                        tracing::warn!("No paper count for {}: {}", author, e);
                        0
                    }
                }
            }
        }
    }
}

/// Progress as recorded by the last checkpoint, plus the store size.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlStatus {
    pub mode: Option<FrontierMode>,
    pub steps_completed: u64,
    pub queued: usize,
    pub visited: usize,
    /// Next authors in dequeue order.
    pub up_next: Vec<String>,
    pub checkpoint_saved_at: Option<DateTime<Utc>>,
    pub stored_papers: usize,
}

pub async fn status(checkpoints: &CheckpointStore, store: &PaperStore) -> Result<CrawlStatus> {
    let stored_papers = store.count().await?;
    let status = match checkpoints.load()? {
        Some(checkpoint) => CrawlStatus {
            mode: Some(checkpoint.frontier.mode),
            steps_completed: checkpoint.steps_completed,
            queued: checkpoint.frontier.entries.len(),
            visited: checkpoint.visited.len(),
            up_next: checkpoint.frontier.entries.iter().take(10).map(|e| e.name.clone()).collect(),
            checkpoint_saved_at: Some(checkpoint.saved_at),
            stored_papers,
        },
        None => CrawlStatus {
            mode: None,
            steps_completed: 0,
            queued: 0,
            visited: 0,
            up_next: Vec::new(),
            checkpoint_saved_at: None,
            stored_papers,
        },
    };
    Ok(status)
}

/// Co-authors across `papers` in first-seen order, excluding `author`.
fn collaborators_of(author: &str, papers: &[PaperRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    papers
        .iter()
        .flat_map(|p| p.authors.iter())
        .map(|name| name.trim())
        .filter(|name| !name.is_empty() && *name != author)
        .filter(|name| seen.insert(name.to_string()))
        .map(str::to_string)
        .collect()
}
