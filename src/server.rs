use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters, model::*, tool, tool_handler,
    tool_router, ErrorData as McpError, ServerHandler,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::apis::arxiv::canonical_id;
use crate::config::Config;
use crate::crawl::{self, CrawlContext, Crawler};
use crate::graph::{self, GraphKind};
use crate::ingest::{self, SourceIngestor};

const MAX_CRAWL_AUTHORS: usize = 20;
const DEFAULT_DEGREE: usize = 2;
const MAX_DEGREE: usize = 5;

// ── Parameter structs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct CrawlAuthorsParams {
    #[schemars(description = "Author name to queue before crawling (optional when resuming)")]
    seed_author: Option<String>,
    #[schemars(description = "Authors to process in this call (default 1, max 20)")]
    max_authors: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetPaperParams {
    #[schemars(description = "arXiv identifier, e.g. 2301.12345 or hep-th/9901001")]
    id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct IngestPaperParams {
    #[schemars(description = "arXiv identifier to fetch, enrich from its LaTeX source and store")]
    id: String,
    #[schemars(description = "Replace the stored record if the paper was ingested before")]
    reingest: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CollaboratorGraphParams {
    #[schemars(description = "Author at the center of the graph")]
    seed_author: String,
    #[schemars(description = "Maximum hop distance (default 2, max 5)")]
    degree: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CitationGraphParams {
    #[schemars(description = "arXiv identifier of a stored paper")]
    seed_paper: String,
    #[schemars(description = "Maximum hop distance (default 2, max 5)")]
    degree: Option<u32>,
}

// ── Server ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CrawlServer {
    tool_router: ToolRouter<Self>,
    ctx: CrawlContext,
    ingestor: SourceIngestor,
    /// One crawl at a time; they share the checkpoint.
    crawl_lock: Arc<Mutex<()>>,
}

fn to_json<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Serialization error: {}", e), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn clamp_degree(degree: Option<u32>) -> usize {
    degree.map(|d| d as usize).unwrap_or(DEFAULT_DEGREE).min(MAX_DEGREE)
}

#[tool_router]
impl CrawlServer {
    pub async fn create(config: &Config) -> anyhow::Result<Self> {
        let ctx = config.open_context(config.crawl.clone()).await?;
        let ingestor = SourceIngestor::new(ctx.source.clone(), ctx.limiter.clone());
        tracing::info!(
            "Serving {} source, data_dir={}",
            ctx.source.name(),
            config.data_dir.display()
        );
        Ok(Self {
            tool_router: Self::tool_router(),
            ctx,
            ingestor,
            crawl_lock: Arc::new(Mutex::new(())),
        })
    }

    #[tool(description = "Show crawl progress from the last checkpoint and the number of stored papers")]
    async fn crawl_status(&self) -> Result<CallToolResult, McpError> {
        let status = crawl::status(&self.ctx.checkpoints, &self.ctx.store)
            .await
            .map_err(|e| McpError::internal_error(format!("Status failed: {}", e), None))?;
        to_json(&status)
    }

    #[tool(description = "Crawl the arXiv co-author graph for a few authors, resuming from the last checkpoint. Returns a run summary.")]
    async fn crawl_authors(
        &self,
        Parameters(params): Parameters<CrawlAuthorsParams>,
    ) -> Result<CallToolResult, McpError> {
        let max = (params.max_authors.unwrap_or(1) as usize).clamp(1, MAX_CRAWL_AUTHORS);
        let _guard = self.crawl_lock.lock().await;

        let mut ctx = self.ctx.clone();
        ctx.settings.max_authors = Some(max);
        let mut crawler = Crawler::resume(ctx)
            .map_err(|e| McpError::internal_error(format!("Cannot resume crawl: {}", e), None))?;
        if let Some(seed) = params.seed_author.as_deref().filter(|s| !s.trim().is_empty()) {
            crawler
                .seed(seed)
                .map_err(|e| McpError::internal_error(format!("Cannot checkpoint seed: {}", e), None))?;
        }
        let summary = crawler
            .run()
            .await
            .map_err(|e| McpError::internal_error(format!("Crawl failed: {}", e), None))?;
        to_json(&summary)
    }

    #[tool(description = "Get a stored paper with its sections and confirmed citations")]
    async fn get_paper(
        &self,
        Parameters(params): Parameters<GetPaperParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = canonical_id(&params.id);
        match self.ctx.store.get(&id).await {
            Ok(Some(paper)) => to_json(&paper),
            Ok(None) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Paper not found: {}",
                id
            ))])),
            Err(e) => Err(McpError::internal_error(format!("Lookup failed: {}", e), None)),
        }
    }

    #[tool(description = "Fetch one paper from arXiv, extract sections and citations from its LaTeX source, and store it")]
    async fn ingest_paper(
        &self,
        Parameters(params): Parameters<IngestPaperParams>,
    ) -> Result<CallToolResult, McpError> {
        let report = ingest::ingest_into_store(
            &self.ingestor,
            &self.ctx.store,
            &params.id,
            params.reingest.unwrap_or(false),
        )
        .await
        .map_err(|e| McpError::internal_error(format!("Ingestion failed: {}", e), None))?;
        to_json(&report)
    }

    #[tool(description = "Co-author neighborhood of an author among stored papers, with edge weights counting shared papers")]
    async fn collaborator_graph(
        &self,
        Parameters(params): Parameters<CollaboratorGraphParams>,
    ) -> Result<CallToolResult, McpError> {
        self.graph(GraphKind::Collaborators, &params.seed_author, params.degree)
            .await
    }

    #[tool(description = "Citation neighborhood of a stored paper, linking papers through the works they cite")]
    async fn citation_graph(
        &self,
        Parameters(params): Parameters<CitationGraphParams>,
    ) -> Result<CallToolResult, McpError> {
        self.graph(GraphKind::Citations, &params.seed_paper, params.degree)
            .await
    }
}

impl CrawlServer {
    async fn graph(&self, kind: GraphKind, seed: &str, degree: Option<u32>) -> Result<CallToolResult, McpError> {
        let neighborhood = graph::neighborhood(&self.ctx.store, kind, seed, clamp_degree(degree))
            .await
            .map_err(|e| McpError::internal_error(format!("Graph query failed: {}", e), None))?;
        to_json(&neighborhood)
    }
}

#[tool_handler]
impl ServerHandler for CrawlServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Crawl arXiv authors breadth-first through their co-authors, storing each \
                 paper with sections and citations extracted from its LaTeX source. Query \
                 collaborator and citation neighborhoods of the stored corpus. Crawls resume \
                 from a checkpoint and respect arXiv rate limits."
                    .into(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degree_defaults_and_caps() {
        assert_eq!(clamp_degree(None), 2);
        assert_eq!(clamp_degree(Some(0)), 0);
        assert_eq!(clamp_degree(Some(9)), 5);
    }
}
