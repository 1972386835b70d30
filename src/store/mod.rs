pub mod checkpoint;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use chrono::{NaiveDate, Utc};
use futures::stream::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::apis::{CitationEntry, PaperRecord};

const TABLE_NAME: &str = "papers";

/// Outcome of a bulk insert. Identifiers already stored (or repeated within the
/// batch) land in `duplicates`; that is not an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkInsertReport {
    pub inserted: Vec<String>,
    pub duplicates: Vec<String>,
}

/// LanceDB-backed paper collection keyed uniquely on paper id.
///
/// All writes go through one lock and insert with `merge_insert` on `id`, so for any
/// identifier exactly one insert survives no matter how many workers race on it.
pub struct PaperStore {
    db: lancedb::Connection,
    schema: Arc<Schema>,
    write_lock: Mutex<()>,
}

fn make_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("authors_json", DataType::Utf8, false),
        Field::new("abstract_text", DataType::Utf8, true),
        Field::new("date", DataType::Utf8, true),
        Field::new("sections_json", DataType::Utf8, true),
        Field::new("citations_json", DataType::Utf8, true),
        Field::new("ingested_at", DataType::Utf8, true),
    ]))
}

fn id_filter(id: &str) -> String {
    format!("id = {}", quote(id))
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

impl PaperStore {
    /// Create or open the store at the given path.
    pub async fn create_or_open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).context("Failed to create paper store directory")?;
        let uri = path.to_str().context("Paper store path is not valid UTF-8")?;

        let db = lancedb::connect(uri)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        let schema = make_schema();

        let tables = db.table_names().execute().await.context("Failed to list tables")?;
        if !tables.contains(&TABLE_NAME.to_string()) {
            db.create_empty_table(TABLE_NAME, schema.clone())
                .execute()
                .await
                .context("Failed to create papers table")?;
        }

        Ok(Self { db, schema, write_lock: Mutex::new(()) })
    }

    async fn table(&self) -> Result<lancedb::Table> {
        self.db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open papers table")
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        let table = self.table().await?;
        let n = table
            .count_rows(Some(id_filter(id)))
            .await
            .context("Failed to check paper existence")?;
        Ok(n > 0)
    }

    /// Insert `record` unless its id is already stored. Returns whether it was inserted.
    pub async fn upsert(&self, record: &PaperRecord) -> Result<bool> {
        let report = self.bulk_insert(std::slice::from_ref(record)).await?;
        Ok(!report.inserted.is_empty())
    }

    /// Best-effort insert: duplicates are reported and skipped, the rest are stored.
    pub async fn bulk_insert(&self, records: &[PaperRecord]) -> Result<BulkInsertReport> {
        let _guard = self.write_lock.lock().await;
        let mut report = BulkInsertReport::default();

        let mut in_batch = HashSet::new();
        let mut candidates = Vec::with_capacity(records.len());
        for record in records {
            if in_batch.insert(record.id.as_str()) {
                candidates.push(record);
            } else {
                report.duplicates.push(record.id.clone());
            }
        }
        if candidates.is_empty() {
            return Ok(report);
        }

        let ids: Vec<&str> = candidates.iter().map(|r| r.id.as_str()).collect();
        let existing = self.existing_ids(&ids).await?;

        let mut fresh = Vec::with_capacity(candidates.len());
        for record in candidates {
            if existing.contains(&record.id) {
                report.duplicates.push(record.id.clone());
            } else {
                fresh.push(record.clone());
            }
        }

        if !fresh.is_empty() {
            self.insert_new(&fresh).await?;
            report.inserted = fresh.into_iter().map(|r| r.id).collect();
        }
        if !report.duplicates.is_empty() {
            tracing::debug!("Skipped {} already stored papers: {:?}", report.duplicates.len(), report.duplicates);
        }
        Ok(report)
    }

    /// Overwrite a stored record, or insert it if absent (explicit re-ingest).
    /// A single merge on `id`, so readers see either the old record or the new one.
    pub async fn replace(&self, record: &PaperRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.merge(std::slice::from_ref(record), true).await
    }

    async fn insert_new(&self, records: &[PaperRecord]) -> Result<()> {
        self.merge(records, false).await
    }

    async fn merge(&self, records: &[PaperRecord], overwrite: bool) -> Result<()> {
        let table = self.table().await?;
        let batch = records_to_batch(&self.schema, records)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], self.schema.clone());

        let mut merge = table.merge_insert(&["id"]);
        if overwrite {
            merge.when_matched_update_all(None);
        }
        merge.when_not_matched_insert_all();
        merge
            .execute(Box::new(batches))
            .await
            .context("Failed to write papers")?;
        Ok(())
    }

    async fn existing_ids(&self, ids: &[&str]) -> Result<HashSet<String>> {
        let table = self.table().await?;
        let filter = format!(
            "id IN ({})",
            ids.iter().map(|id| quote(id)).collect::<Vec<_>>().join(", ")
        );
        let mut stream = table
            .query()
            .only_if(filter)
            .limit(ids.len())
            .execute()
            .await
            .context("Failed to query existing ids")?;

        let mut found = HashSet::new();
        while let Some(batch) = stream.next().await {
            let batch = batch.context("Failed to read id batch")?;
            let col = string_column(&batch, "id")?;
            for i in 0..batch.num_rows() {
                found.insert(col.value(i).to_string());
            }
        }
        Ok(found)
    }

    pub async fn get(&self, id: &str) -> Result<Option<PaperRecord>> {
        let table = self.table().await?;
        let mut stream = table
            .query()
            .only_if(id_filter(id))
            .limit(1)
            .execute()
            .await
            .context("Failed to query by ID")?;

        while let Some(batch) = stream.next().await {
            let batch = batch.context("Failed to read query result")?;
            if let Some(record) = batch_to_records(&batch)?.into_iter().next() {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Every stored paper, in no particular order.
    pub async fn all_papers(&self) -> Result<Vec<PaperRecord>> {
        let table = self.table().await?;
        let total = table.count_rows(None).await.context("Failed to count rows")?;
        if total == 0 {
            return Ok(Vec::new());
        }

        let mut stream = table
            .query()
            .limit(total)
            .execute()
            .await
            .context("Failed to scan papers")?;

        let mut papers = Vec::with_capacity(total);
        while let Some(batch) = stream.next().await {
            let batch = batch.context("Failed to read scan batch")?;
            papers.extend(batch_to_records(&batch)?);
        }
        Ok(papers)
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.table().await?;
        table.count_rows(None).await.context("Failed to count rows")
    }
}

fn records_to_batch(schema: &Arc<Schema>, records: &[PaperRecord]) -> Result<RecordBatch> {
    let ingested_at = Utc::now().to_rfc3339();
    let mut authors = Vec::with_capacity(records.len());
    let mut sections = Vec::with_capacity(records.len());
    let mut citations = Vec::with_capacity(records.len());
    for r in records {
        authors.push(serde_json::to_string(&r.authors)?);
        sections.push(if r.sections.is_empty() { None } else { Some(serde_json::to_string(&r.sections)?) });
        citations.push(if r.citations.is_empty() { None } else { Some(serde_json::to_string(&r.citations)?) });
    }

    RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.id.as_str()))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.title.as_str()))),
            Arc::new(StringArray::from_iter_values(authors.iter())),
            Arc::new(StringArray::from(
                records.iter().map(|r| Some(r.abstract_text.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.date.map(|d| d.to_string())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(sections)),
            Arc::new(StringArray::from(citations)),
            Arc::new(StringArray::from(vec![Some(ingested_at.as_str()); records.len()])),
        ],
    )
    .context("Failed to create RecordBatch")
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .with_context(|| format!("Missing {} column", name))
}

fn batch_to_records(batch: &RecordBatch) -> Result<Vec<PaperRecord>> {
    let ids = string_column(batch, "id")?;
    let titles = string_column(batch, "title")?;
    let authors = string_column(batch, "authors_json")?;
    let abstracts = string_column(batch, "abstract_text")?;
    let dates = string_column(batch, "date")?;
    let sections = string_column(batch, "sections_json")?;
    let citations = string_column(batch, "citations_json")?;

    let opt = |a: &StringArray, row: usize| -> Option<String> {
        if a.is_null(row) { None } else { Some(a.value(row).to_string()) }
    };

    (0..batch.num_rows())
        .map(|row| {
            let id = ids.value(row).to_string();
            let sections: BTreeMap<String, String> = match opt(sections, row) {
                Some(json) => serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt sections for {}", id))?,
                None => BTreeMap::new(),
            };
            let citations: Vec<CitationEntry> = match opt(citations, row) {
                Some(json) => serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt citations for {}", id))?,
                None => Vec::new(),
            };
            Ok(PaperRecord {
                title: titles.value(row).to_string(),
                authors: serde_json::from_str(authors.value(row))
                    .with_context(|| format!("Corrupt authors for {}", id))?,
                date: opt(dates, row).and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
                abstract_text: opt(abstracts, row).unwrap_or_default(),
                sections,
                citations,
                id,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::testing::paper;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = PaperStore::create_or_open(tmp.path()).await.unwrap();

        let mut record = paper("1009.3896", &["Alice", "Bob"]);
        record.date = NaiveDate::from_ymd_opt(2010, 9, 20);
        record.sections.insert("Intro".into(), "Hello".into());
        record.citations.push(CitationEntry {
            key: "foo2020".into(),
            entry_type: "article".into(),
            fields: [("title".to_string(), "Foo".to_string())].into_iter().collect(),
        });

        assert!(!store.exists("1009.3896").await.unwrap());
        assert!(store.upsert(&record).await.unwrap());
        assert!(store.exists("1009.3896").await.unwrap());

        let got = store.get("1009.3896").await.unwrap().unwrap();
        assert_eq!(got, record);
        assert!(store.get("0000.0000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_is_first_write_wins() {
        let tmp = TempDir::new().unwrap();
        let store = PaperStore::create_or_open(tmp.path()).await.unwrap();

        let first = paper("p1", &["A"]);
        let mut second = paper("p1", &["B"]);
        second.title = "Different".into();

        assert!(store.upsert(&first).await.unwrap());
        assert!(!store.upsert(&second).await.unwrap());

        assert_eq!(store.count().await.unwrap(), 1);
        let got = store.get("p1").await.unwrap().unwrap();
        assert_eq!(got.title, first.title);
        assert_eq!(got.authors, vec!["A"]);
    }

    #[tokio::test]
    async fn test_bulk_insert_tolerates_duplicates() {
        let tmp = TempDir::new().unwrap();
        let store = PaperStore::create_or_open(tmp.path()).await.unwrap();
        store.upsert(&paper("p2", &["A"])).await.unwrap();

        let batch = vec![paper("p1", &["A"]), paper("p2", &["X"]), paper("p3", &["A"]), paper("p1", &["Y"])];
        let report = store.bulk_insert(&batch).await.unwrap();

        assert_eq!(report.inserted, vec!["p1", "p3"]);
        assert_eq!(report.duplicates, vec!["p1", "p2"]);
        assert_eq!(store.count().await.unwrap(), 3);
        assert_eq!(store.get("p2").await.unwrap().unwrap().authors, vec!["A"]);
        assert_eq!(store.get("p1").await.unwrap().unwrap().authors, vec!["A"]);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_keep_one_record() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(PaperStore::create_or_open(tmp.path()).await.unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut p = paper("same", &["A"]);
                    p.title = format!("writer {}", i);
                    store.upsert(&p).await.unwrap()
                })
            })
            .collect();

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replace_and_scan() {
        let tmp = TempDir::new().unwrap();
        let store = PaperStore::create_or_open(tmp.path()).await.unwrap();
        store.bulk_insert(&[paper("p1", &["A"]), paper("p2", &["B"])]).await.unwrap();

        let mut updated = paper("p1", &["A", "C"]);
        updated.sections.insert("Method".into(), "New".into());
        store.replace(&updated).await.unwrap();

        let mut all = store.all_papers().await.unwrap();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], updated);
        assert_eq!(all[1].authors, vec!["B"]);
    }

    #[tokio::test]
    async fn test_replace_overwrites_in_place() {
        let tmp = TempDir::new().unwrap();
        let store = PaperStore::create_or_open(tmp.path()).await.unwrap();
        store.upsert(&paper("p1", &["A"])).await.unwrap();

        let mut fresh = paper("p1", &["A", "B"]);
        fresh.title = "Revised".into();
        fresh.citations.push(CitationEntry {
            key: "bar2021".into(),
            entry_type: "misc".into(),
            fields: BTreeMap::new(),
        });
        store.replace(&fresh).await.unwrap();
        store.replace(&fresh).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get("p1").await.unwrap().unwrap(), fresh);

        // absent ids are inserted
        store.replace(&paper("p9", &["Z"])).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.exists("p9").await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_keeps_papers() {
        let tmp = TempDir::new().unwrap();
        {
            let store = PaperStore::create_or_open(tmp.path()).await.unwrap();
            store.upsert(&paper("p1", &["A"])).await.unwrap();
        }
        let store = PaperStore::create_or_open(tmp.path()).await.unwrap();
        assert!(store.exists("p1").await.unwrap());
        assert!(store.all_papers().await.unwrap().iter().any(|p| p.id == "p1"));
    }
}
