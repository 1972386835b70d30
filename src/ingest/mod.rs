pub mod latex;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::apis::arxiv::canonical_id;
use crate::apis::{CitationEntry, PaperRecord, PaperSource};
use crate::ratelimit::RateLimiter;
use crate::store::PaperStore;

/// Fields derived from a paper's LaTeX source.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnrichedFields {
    pub sections: BTreeMap<String, String>,
    pub citations: Vec<CitationEntry>,
}

impl EnrichedFields {
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty() && self.citations.is_empty()
    }

    pub fn merge_into(self, record: &mut PaperRecord) {
        record.sections = self.sections;
        record.citations = self.citations;
    }
}

/// Turns a paper identifier into sections and confirmed citations.
///
/// Never fails: download and extraction problems are logged and yield empty
/// fields, so callers still store the base metadata.
#[derive(Clone)]
pub struct SourceIngestor {
    source: Arc<dyn PaperSource>,
    limiter: Arc<RateLimiter>,
}

impl SourceIngestor {
    pub fn new(source: Arc<dyn PaperSource>, limiter: Arc<RateLimiter>) -> Self {
        Self { source, limiter }
    }

    pub async fn ingest(&self, id: &str) -> EnrichedFields {
        self.limiter.acquire().await;
        let dir = match self.source.fetch_paper_source(id).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!("No source for {}: {}", id, e);
                return EnrichedFields::default();
            }
        };

        // The directory moves into the blocking task and is dropped there, so it is
        // removed whether extraction finishes or panics.
        let paper_id = id.to_string();
        let extracted = tokio::task::spawn_blocking(move || {
            let fields = EnrichedFields {
                sections: latex::extract_sections(dir.path()),
                citations: latex::extract_citations(dir.path()),
            };
            if let Err(e) = dir.close() {
                tracing::warn!("Failed to remove source tree of {}: {}", paper_id, e);
            }
            fields
        })
        .await;

        match extracted {
            Ok(fields) => {
                tracing::debug!(
                    "Extracted {} sections and {} citations from {}",
                    fields.sections.len(),
                    fields.citations.len(),
                    id
                );
                fields
            }
            Err(e) => {
                tracing::warn!("Extraction for {} aborted: {}", id, e);
                EnrichedFields::default()
            }
        }
    }

    /// Fetch a paper's metadata and enrich it. `None` when the paper does not exist.
    pub async fn ingest_by_id(&self, id: &str) -> Result<Option<PaperRecord>, crate::apis::SourceError> {
        self.limiter.acquire().await;
        let Some(mut record) = self.source.fetch_paper_metadata(id).await? else {
            return Ok(None);
        };
        self.ingest(&record.id).await.merge_into(&mut record);
        Ok(Some(record))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Inserted,
    Replaced,
    AlreadyStored,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub id: String,
    pub status: IngestStatus,
    pub title: Option<String>,
    pub sections: usize,
    pub citations: usize,
}

impl IngestReport {
    fn of(status: IngestStatus, record: &PaperRecord) -> Self {
        Self {
            id: record.id.clone(),
            status,
            title: Some(record.title.clone()),
            sections: record.sections.len(),
            citations: record.citations.len(),
        }
    }
}

/// Ingest a single paper into `store`. Stored papers are left alone unless
/// `reingest` is set, in which case the record is fetched again and replaced.
pub async fn ingest_into_store(
    ingestor: &SourceIngestor,
    store: &PaperStore,
    id: &str,
    reingest: bool,
) -> Result<IngestReport> {
    let id = canonical_id(id);
    if !reingest {
        if let Some(existing) = store.get(&id).await? {
            return Ok(IngestReport::of(IngestStatus::AlreadyStored, &existing));
        }
    }

    let Some(record) = ingestor.ingest_by_id(&id).await? else {
        tracing::warn!("Paper {} not found at {}", id, ingestor.source.name());
        return Ok(IngestReport {
            id,
            status: IngestStatus::NotFound,
            title: None,
            sections: 0,
            citations: 0,
        });
    };

    let status = if reingest {
        store.replace(&record).await?;
        IngestStatus::Replaced
    } else if store.upsert(&record).await? {
        IngestStatus::Inserted
    } else {
        IngestStatus::AlreadyStored
    };
    tracing::info!("Ingested {} ({:?})", record.id, status);
    Ok(IngestReport::of(status, &record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::testing::{paper, MockSource};
    use std::time::Duration;

    fn ingestor(source: MockSource) -> (SourceIngestor, Arc<MockSource>) {
        let source = Arc::new(source);
        let limiter = Arc::new(RateLimiter::new(100, Duration::from_millis(10)));
        (SourceIngestor::new(source.clone(), limiter), source)
    }

    #[tokio::test]
    async fn test_ingest_extracts_sections_and_citations() {
        let mut source = MockSource::default();
        source.sources.insert(
            "p1".into(),
            vec![
                ("main.tex".into(), "\\section{Intro}\nSee \\cite{foo2020}.".into()),
                ("refs.bib".into(), "@article{foo2020, title={Foo}}\n@article{bar2021, title={Bar}}".into()),
            ],
        );
        let (ingestor, _) = ingestor(source);

        let fields = ingestor.ingest("p1").await;
        assert_eq!(fields.sections["Intro"], "See \\cite{foo2020}.");
        assert_eq!(fields.citations.len(), 1);
        assert_eq!(fields.citations[0].key, "foo2020");
    }

    #[tokio::test]
    async fn test_download_failure_yields_empty_fields() {
        let (ingestor, source) = ingestor(MockSource::default());
        let fields = ingestor.ingest("missing").await;
        assert!(fields.is_empty());
        assert_eq!(source.calls(), vec!["source:missing"]);
    }

    #[tokio::test]
    async fn test_ingest_by_id_merges_fields() {
        let mut source = MockSource::default();
        source.metadata.insert("p1".into(), paper("p1", &["A"]));
        source
            .sources
            .insert("p1".into(), vec![("main.tex".into(), "\\section{Results}\nDone.".into())]);
        let (ingestor, _) = ingestor(source);

        let record = ingestor.ingest_by_id("p1").await.unwrap().unwrap();
        assert_eq!(record.authors, vec!["A"]);
        assert_eq!(record.sections["Results"], "Done.");

        assert!(ingestor.ingest_by_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ingest_into_store_is_first_write_wins_unless_reingest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = PaperStore::create_or_open(&tmp.path().join("lance")).await.unwrap();

        let mut source = MockSource::default();
        source.metadata.insert("p1".into(), paper("p1", &["A"]));
        source
            .sources
            .insert("p1".into(), vec![("main.tex".into(), "\\section{Intro}\nHello.".into())]);
        let (ingestor, source) = ingestor(source);

        let report = ingest_into_store(&ingestor, &store, "p1v2", false).await.unwrap();
        assert_eq!(report.status, IngestStatus::Inserted);
        assert_eq!(report.id, "p1");
        assert_eq!(report.sections, 1);

        let report = ingest_into_store(&ingestor, &store, "p1", false).await.unwrap();
        assert_eq!(report.status, IngestStatus::AlreadyStored);
        assert_eq!(source.calls().iter().filter(|c| c.starts_with("meta:")).count(), 1);

        let report = ingest_into_store(&ingestor, &store, "p1", true).await.unwrap();
        assert_eq!(report.status, IngestStatus::Replaced);
        assert_eq!(store.count().await.unwrap(), 1);

        let report = ingest_into_store(&ingestor, &store, "nope", false).await.unwrap();
        assert_eq!(report.status, IngestStatus::NotFound);
    }
}
