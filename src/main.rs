use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand, ValueEnum};
use rmcp::{transport::stdio, ServiceExt};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod apis;
mod config;
mod crawl;
mod graph;
mod ingest;
mod ratelimit;
mod server;
mod store;

use config::Config;
use crawl::frontier::FrontierMode;
use crawl::Crawler;
use graph::GraphKind;
use ingest::SourceIngestor;
use server::CrawlServer;

#[derive(Debug, Parser)]
#[command(name = "litcrawl", version, about = "Crawl arXiv co-author graphs into a local paper store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Crawl authors breadth-first, resuming from the last checkpoint
    Crawl {
        /// Author to queue before crawling
        #[arg(long)]
        seed: Option<String>,
        /// Stop after this many authors
        #[arg(long)]
        max_authors: Option<usize>,
        /// Frontier ordering for a fresh crawl
        #[arg(long)]
        mode: Option<FrontierMode>,
    },
    /// Fetch, enrich and store a single paper
    Ingest {
        id: String,
        /// Replace the stored record
        #[arg(long)]
        reingest: bool,
    },
    /// Print the neighborhood of a node in the stored corpus
    Graph {
        #[arg(value_enum)]
        kind: GraphArg,
        seed: String,
        #[arg(long, default_value_t = 2)]
        degree: usize,
    },
    /// Print crawl progress
    Status,
    /// Delete the checkpoint so the next crawl starts from scratch (stored papers are kept)
    Reset,
    /// Run the MCP server on stdio
    Serve,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GraphArg {
    Collaborators,
    Citations,
}

impl From<GraphArg> for GraphKind {
    fn from(arg: GraphArg) -> Self {
        match arg {
            GraphArg::Collaborators => GraphKind::Collaborators,
            GraphArg::Citations => GraphKind::Citations,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Crawl { seed, max_authors, mode } => {
            let ctx = config.open_context(config.crawl_settings(mode, max_authors)).await?;
            let mut crawler = Crawler::resume(ctx)?;
            if let Some(seed) = seed.as_deref() {
                crawler.seed(seed)?;
            }
            if crawler.frontier().is_empty() {
                tracing::warn!("Nothing to crawl: pass --seed or resume a checkpoint with queued authors");
            }

            let stop = crawler.stop_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Stop requested, finishing the current author");
                    stop.store(true, Ordering::SeqCst);
                }
            });

            let summary = crawler.run().await?;
            print_json(&summary)?;
        }
        Command::Ingest { id, reingest } => {
            let ctx = config.open_context(config.crawl.clone()).await?;
            let ingestor = SourceIngestor::new(ctx.source.clone(), ctx.limiter.clone());
            let report = ingest::ingest_into_store(&ingestor, &ctx.store, &id, reingest).await?;
            print_json(&report)?;
        }
        Command::Graph { kind, seed, degree } => {
            let store = store::PaperStore::create_or_open(&config.store_dir()).await?;
            let neighborhood = graph::neighborhood(&store, kind.into(), &seed, degree).await?;
            print_json(&neighborhood)?;
        }
        Command::Status => {
            let store = store::PaperStore::create_or_open(&config.store_dir()).await?;
            let checkpoints = store::checkpoint::CheckpointStore::new(&config.data_dir);
            print_json(&crawl::status(&checkpoints, &store).await?)?;
        }
        Command::Reset => {
            let checkpoints = store::checkpoint::CheckpointStore::new(&config.data_dir);
            if checkpoints.clear()? {
                tracing::info!("Removed {}", checkpoints.path().display());
            } else {
                tracing::info!("No checkpoint at {}", checkpoints.path().display());
            }
        }
        Command::Serve => {
            tracing::info!("Starting litcrawl MCP server");
            let server = CrawlServer::create(&config).await?;
            let service = server.serve(stdio()).await?;
            service.waiting().await?;
        }
    }

    Ok(())
}
