use std::io::{Cursor, Read};
use std::path::Path;

use super::{PaperRecord, PaperSource, SourceError};
use async_trait::async_trait;
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use quick_xml::events::Event;
use quick_xml::Reader;
use scraper::{Html, Selector};
use tempfile::TempDir;

const API_URL: &str = "https://export.arxiv.org/api/query";
const ABS_URL: &str = "https://arxiv.org/abs";
const EPRINT_URL: &str = "https://arxiv.org/e-print";
/// Upper bound on a source archive, both as downloaded and once decompressed.
const MAX_SOURCE_BYTES: u64 = 256 * 1024 * 1024;
const USER_AGENT: &str = concat!("litcrawl/", env!("CARGO_PKG_VERSION"));

pub struct ArxivClient {
    client: reqwest::Client,
}

impl ArxivClient {
    pub fn new() -> Result<Self, SourceError> {
        Ok(Self {
            client: reqwest::Client::builder().user_agent(USER_AGENT).build()?,
        })
    }

    async fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<String, SourceError> {
        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::Status { status: status.as_u16(), url: url.to_string() });
        }
        Ok(resp.text().await?)
    }
}

#[async_trait]
impl PaperSource for ArxivClient {
    fn name(&self) -> &str {
        "arxiv"
    }

    async fn fetch_author_page(
        &self,
        author: &str,
        start: u32,
        page_size: u32,
    ) -> Result<Vec<PaperRecord>, SourceError> {
        let xml = self
            .get_text(
                API_URL,
                &[
                    ("search_query", author_query(author)),
                    ("start", start.to_string()),
                    ("max_results", page_size.to_string()),
                    ("sortBy", "submittedDate".to_string()),
                    ("sortOrder", "descending".to_string()),
                ],
            )
            .await?;
        Ok(parse_atom_feed(&xml)?.papers)
    }

    async fn fetch_paper_metadata(&self, id: &str) -> Result<Option<PaperRecord>, SourceError> {
        let url = format!("{}/{}", ABS_URL, id);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(SourceError::Status { status: resp.status().as_u16(), url });
        }
        let html = resp.text().await?;
        parse_abs_page(id, &html)
    }

    async fn fetch_author_paper_count(&self, author: &str) -> Result<u64, SourceError> {
        let xml = self
            .get_text(
                API_URL,
                &[
                    ("search_query", author_query(author)),
                    ("start", "0".to_string()),
                    ("max_results", "0".to_string()),
                ],
            )
            .await?;
        parse_atom_feed(&xml)?
            .total_results
            .ok_or_else(|| SourceError::Parse("feed has no opensearch:totalResults".into()))
    }

    async fn fetch_paper_source(&self, id: &str) -> Result<TempDir, SourceError> {
        let url = format!("{}/{}", EPRINT_URL, id);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::Status { status: status.as_u16(), url });
        }
        if resp.content_length().is_some_and(|n| n > MAX_SOURCE_BYTES) {
            return Err(too_large());
        }
        let bytes = resp.bytes().await?;
        if bytes.len() as u64 > MAX_SOURCE_BYTES {
            return Err(too_large());
        }
        tracing::debug!("Downloaded {} bytes of source for {}", bytes.len(), id);

        // The archive stays in memory; only the unpacked tree touches disk.
        tokio::task::spawn_blocking(move || {
            let dir = TempDir::new().map_err(|e| SourceError::Archive(e.to_string()))?;
            unpack_source(&bytes, dir.path())?;
            Ok(dir)
        })
        .await
        .map_err(|e| SourceError::Archive(format!("unpack task failed: {}", e)))?
    }
}

fn author_query(author: &str) -> String {
    format!("au:\"{}\"", author.trim())
}

/// Strip the abs URL prefix and the version suffix from an arXiv identifier.
pub fn canonical_id(raw: &str) -> String {
    let raw = raw.trim();
    let id = match raw.find("/abs/") {
        Some(pos) => &raw[pos + "/abs/".len()..],
        None => raw.strip_prefix("arXiv:").unwrap_or(raw),
    };
    if let Some(v) = id.rfind('v') {
        let (head, tail) = id.split_at(v);
        let digits = &tail[1..];
        if !digits.is_empty()
            && digits.chars().all(|c| c.is_ascii_digit())
            && head.chars().last().is_some_and(|c| c.is_ascii_digit())
        {
            return head.to_string();
        }
    }
    id.to_string()
}

fn too_large() -> SourceError {
    SourceError::Archive(format!("source archive exceeds {} bytes", MAX_SOURCE_BYTES))
}

fn unpack_source(bytes: &[u8], dir: &Path) -> Result<(), SourceError> {
    unpack_source_within(bytes, dir, MAX_SOURCE_BYTES)
}

fn unpack_source_within(bytes: &[u8], dir: &Path, limit: u64) -> Result<(), SourceError> {
    let data = if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        GzDecoder::new(bytes)
            .take(limit + 1)
            .read_to_end(&mut out)
            .map_err(|e| SourceError::Archive(format!("corrupt gzip stream: {}", e)))?;
        if out.len() as u64 > limit {
            return Err(SourceError::Archive(format!(
                "source archive exceeds {} bytes once decompressed",
                limit
            )));
        }
        out
    } else if bytes.starts_with(b"%PDF") {
        return Err(SourceError::Archive("submission has no LaTeX source (PDF only)".into()));
    } else if bytes.len() as u64 > limit {
        return Err(SourceError::Archive(format!("source archive exceeds {} bytes", limit)));
    } else {
        bytes.to_vec()
    };

    if is_tar(&data) {
        tar::Archive::new(Cursor::new(data))
            .unpack(dir)
            .map_err(|e| SourceError::Archive(format!("corrupt tar archive: {}", e)))?;
    } else if bytes.starts_with(&[0x1f, 0x8b]) {
        // single gzipped .tex file
        std::fs::write(dir.join("main.tex"), &data)
            .map_err(|e| SourceError::Archive(e.to_string()))?;
    } else {
        return Err(SourceError::Archive("unrecognised source format".into()));
    }
    Ok(())
}

fn is_tar(data: &[u8]) -> bool {
    data.len() > 262 && &data[257..262] == b"ustar"
}

pub(crate) struct AtomFeed {
    pub papers: Vec<PaperRecord>,
    pub total_results: Option<u64>,
}

pub(crate) fn parse_atom_feed(xml: &str) -> Result<AtomFeed, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut papers = Vec::new();
    let mut total_results = None;
    let mut in_entry = false;
    let mut in_author = false;
    let mut current_tag = String::new();
    let mut title = String::new();
    let mut summary = String::new();
    let mut raw_id = String::new();
    let mut published = String::new();
    let mut author_name = String::new();
    let mut authors: Vec<String> = Vec::new();
    let mut total = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "entry" {
                    in_entry = true;
                    title.clear();
                    summary.clear();
                    raw_id.clear();
                    published.clear();
                    authors.clear();
                } else if tag == "author" && in_entry {
                    in_author = true;
                    author_name.clear();
                }
                current_tag = tag;
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if !in_entry {
                    if current_tag == "opensearch:totalResults" {
                        total.push_str(&text);
                    }
                } else {
                    match current_tag.as_str() {
                        "title" => title.push_str(&text),
                        "summary" => summary.push_str(&text),
                        "id" if raw_id.is_empty() => raw_id = text,
                        "published" => published.push_str(&text),
                        "name" if in_author => author_name.push_str(&text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "entry" && in_entry {
                    in_entry = false;
                    let id = canonical_id(&raw_id);
                    if !id.is_empty() && !title.trim().is_empty() {
                        papers.push(PaperRecord {
                            id,
                            title: collapse_whitespace(&title),
                            authors: std::mem::take(&mut authors),
                            date: published
                                .get(..10)
                                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
                            abstract_text: collapse_whitespace(&summary),
                            sections: Default::default(),
                            citations: Vec::new(),
                        });
                    }
                } else if tag == "author" && in_author {
                    in_author = false;
                    let name = author_name.trim();
                    if !name.is_empty() {
                        authors.push(name.to_string());
                    }
                } else if tag == "opensearch:totalResults" {
                    total_results = total.trim().parse::<u64>().ok();
                }
                if tag == current_tag {
                    current_tag.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::Parse(format!("XML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(AtomFeed { papers, total_results })
}

/// Parse an arXiv abstract page (`/abs/<id>`).
pub(crate) fn parse_abs_page(id: &str, html: &str) -> Result<Option<PaperRecord>, SourceError> {
    let document = Html::parse_document(html);
    let select = |css: &str| -> Result<Selector, SourceError> {
        Selector::parse(css).map_err(|e| SourceError::Parse(format!("{:?}", e)))
    };

    let title = document
        .select(&select("h1.title")?)
        .next()
        .map(|el| el.text().collect::<String>())
        .unwrap_or_default();
    let title = collapse_whitespace(title.trim().trim_start_matches("Title:"));
    if title.is_empty() {
        return Ok(None);
    }

    let authors = document
        .select(&select("div.authors a")?)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();

    let abstract_text = document
        .select(&select("blockquote.abstract")?)
        .next()
        .map(|el| el.text().collect::<String>())
        .unwrap_or_default();
    let abstract_text = collapse_whitespace(abstract_text.trim().trim_start_matches("Abstract:"));

    let date = document
        .select(&select("div.submission-history")?)
        .next()
        .and_then(|el| parse_submission_date(&el.text().collect::<String>()));

    let mut record = PaperRecord::new(canonical_id(id), title, authors);
    record.abstract_text = abstract_text;
    record.date = date;
    Ok(Some(record))
}

/// Date of the first version from a submission history block, e.g.
/// `[v1] Mon, 20 Sep 2010 18:34:53 UTC (12 KB)`.
fn parse_submission_date(history: &str) -> Option<NaiveDate> {
    let after = history.split("[v1]").nth(1)?;
    let stamp = after.split('(').next()?;
    let day_month_year: Vec<&str> = stamp
        .split_whitespace()
        .skip_while(|tok| tok.ends_with(','))
        .take(3)
        .collect();
    NaiveDate::parse_from_str(&day_month_year.join(" "), "%d %b %Y").ok()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
