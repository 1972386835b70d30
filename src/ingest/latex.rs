//! Section and citation extraction from an unpacked LaTeX source tree.
//!
//! Every file is processed on its own: a file that cannot be read or parsed is
//! logged and skipped, and the remaining files still contribute.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use walkdir::WalkDir;

use crate::apis::CitationEntry;

static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\section\*?\s*\{([^}]*)\}").expect("valid section regex"));

static SECTION_END_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\bibliography\s*\{|\\begin\{thebibliography\}|\\end\{document\}|\\appendix\b")
        .expect("valid section end regex")
});

static CITE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\[a-zA-Z]*cite[a-zA-Z]*\*?\s*(?:\[[^\]]*\]\s*){0,2}\{([^}]*)\}")
        .expect("valid cite regex")
});

static BIBITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\bibitem\s*(?:\[[^\]]*\])?\s*\{([^}]+)\}").expect("valid bibitem regex")
});

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

fn files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| {
            entry.file_type().is_file()
                && entry.path().extension().is_some_and(|e| e.eq_ignore_ascii_case(ext))
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

fn read_source(path: &Path) -> Result<String, ExtractionError> {
    let bytes = std::fs::read(path).map_err(|source| ExtractionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    // Older submissions are frequently latin-1.
    Ok(String::from_utf8(bytes)
        .unwrap_or_else(|e| e.into_bytes().iter().map(|&b| b as char).collect()))
}

/// Read every file with the given extension, skipping the ones that fail.
fn read_all(dir: &Path, ext: &str) -> Vec<(PathBuf, String)> {
    files_with_extension(dir, ext)
        .into_iter()
        .filter_map(|path| match read_source(&path) {
            Ok(text) => Some((path, text)),
            Err(e) => {
                tracing::warn!("Skipping source file: {}", e);
                None
            }
        })
        .collect()
}

fn strip_comments(text: &str) -> String {
    text.lines()
        .map(|line| {
            // `%` is escaped only by an odd run of backslashes; `\\%` is a line break then a comment
            let mut backslashes = 0usize;
            for (i, c) in line.char_indices() {
                match c {
                    '\\' => backslashes += 1,
                    '%' if backslashes % 2 == 0 => return &line[..i],
                    _ => backslashes = 0,
                }
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Map section heading to section body across all `.tex` files under `dir`.
pub fn extract_sections(dir: &Path) -> BTreeMap<String, String> {
    let mut sections: BTreeMap<String, String> = BTreeMap::new();

    for (_path, text) in read_all(dir, "tex") {
        for (title, body) in sections_of(&strip_comments(&text)) {
            sections
                .entry(title)
                .and_modify(|existing| {
                    existing.push_str("\n\n");
                    existing.push_str(&body);
                })
                .or_insert(body);
        }
    }
    sections
}

fn sections_of(text: &str) -> Vec<(String, String)> {
    let headings: Vec<_> = SECTION_RE.captures_iter(text).collect();
    let mut out = Vec::with_capacity(headings.len());

    for (i, cap) in headings.iter().enumerate() {
        let (Some(whole), Some(title)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let title = title.as_str().split_whitespace().collect::<Vec<_>>().join(" ");
        if title.is_empty() {
            continue;
        }
        let body_start = whole.end();
        let mut body_end = headings
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |m| m.start());
        if let Some(stop) = SECTION_END_RE.find(&text[body_start..body_end]) {
            body_end = body_start + stop.start();
        }
        out.push((title, text[body_start..body_end].trim().to_string()));
    }
    out
}

/// Bibliography entries that are actually cited from some `.tex` file.
///
/// An entry counts as cited when its key occurs as a substring of the argument of
/// any citation macro. A key that is a prefix of another cited key therefore also
/// matches.
pub fn extract_citations(dir: &Path) -> Vec<CitationEntry> {
    let cited: Vec<String> = read_all(dir, "tex")
        .iter()
        .flat_map(|(_, text)| cite_arguments(&strip_comments(text)))
        .collect();
    if cited.is_empty() {
        return Vec::new();
    }

    let mut entries = Vec::new();
    for (path, text) in read_all(dir, "bib") {
        match parse_bibtex(&path, &text) {
            Ok(parsed) => entries.extend(parsed),
            Err(e) => tracing::warn!("Skipping bibliography: {}", e),
        }
    }
    for (_path, text) in read_all(dir, "bbl") {
        entries.extend(parse_bbl(&text));
    }

    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| cited.iter().any(|arg| arg.contains(entry.key.as_str())))
        .filter(|entry| seen.insert(entry.key.clone()))
        .collect()
}

fn cite_arguments(text: &str) -> Vec<String> {
    CITE_RE
        .captures_iter(text)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Entries of a `thebibliography` environment; the body of each item is kept
/// in the `text` field.
pub fn parse_bbl(text: &str) -> Vec<CitationEntry> {
    let items: Vec<_> = BIBITEM_RE.captures_iter(text).collect();
    let end = text.find("\\end{thebibliography}").unwrap_or(text.len());

    items
        .iter()
        .enumerate()
        .filter_map(|(i, cap)| {
            let whole = cap.get(0)?;
            let key = cap.get(1)?.as_str().trim().to_string();
            let body_end = items
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(end, |m| m.start())
                .max(whole.end());
            let body = text[whole.end()..body_end]
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            let mut fields = BTreeMap::new();
            if !body.is_empty() {
                fields.insert("text".to_string(), body);
            }
            Some(CitationEntry { key, entry_type: "bibitem".to_string(), fields })
        })
        .collect()
}

/// Parse BibTeX entries. `@string`, `@comment` and `@preamble` blocks are skipped.
pub fn parse_bibtex(path: &Path, text: &str) -> Result<Vec<CitationEntry>, ExtractionError> {
    let mut entries = Vec::new();
    let mut rest = text;

    while let Some(at) = rest.find('@') {
        rest = &rest[at + 1..];
        let Some(open) = rest.find(['{', '(']) else {
            break;
        };
        let entry_type = rest[..open].trim().to_lowercase();
        if entry_type.is_empty() || !entry_type.chars().all(|c| c.is_ascii_alphanumeric()) {
            continue;
        }
        let close = matching_close(rest, open)
            .ok_or_else(|| malformed(path, format!("unbalanced braces in @{} entry", entry_type)))?;
        let body = &rest[open + 1..close];
        rest = &rest[close + 1..];

        if matches!(entry_type.as_str(), "string" | "comment" | "preamble") {
            continue;
        }

        let (key, field_text) = match body.find(',') {
            Some(comma) => (body[..comma].trim(), &body[comma + 1..]),
            None => (body.trim(), ""),
        };
        if key.is_empty() {
            return Err(malformed(path, format!("@{} entry without a key", entry_type)));
        }
        entries.push(CitationEntry {
            key: key.to_string(),
            entry_type,
            fields: parse_fields(field_text).map_err(|reason| malformed(path, reason))?,
        });
    }
    Ok(entries)
}

fn malformed(path: &Path, reason: String) -> ExtractionError {
    ExtractionError::Malformed { path: path.to_path_buf(), reason }
}

fn matching_close(text: &str, open: usize) -> Option<usize> {
    let (opener, closer) = match text.as_bytes()[open] {
        b'(' => (b'(', b')'),
        _ => (b'{', b'}'),
    };
    let mut depth = 0usize;
    for (i, &b) in text.as_bytes().iter().enumerate().skip(open) {
        if b == opener {
            depth += 1;
        } else if b == closer {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

fn parse_fields(text: &str) -> Result<BTreeMap<String, String>, String> {
    let mut fields = BTreeMap::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && (bytes[i].is_ascii_whitespace() || bytes[i] == b',') {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let Some(eq) = text[i..].find('=') else {
            break;
        };
        let name = text[i..i + eq].trim().to_lowercase();
        i += eq + 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            return Err(format!("field {} has no value", name));
        }

        let value = match bytes[i] {
            b'{' => {
                let close = matching_close(text, i).ok_or_else(|| format!("unbalanced value for {}", name))?;
                let v = &text[i + 1..close];
                i = close + 1;
                v.to_string()
            }
            b'"' => {
                let close = text[i + 1..]
                    .find('"')
                    .ok_or_else(|| format!("unterminated quoted value for {}", name))?;
                let v = &text[i + 1..i + 1 + close];
                i += close + 2;
                v.to_string()
            }
            _ => {
                let end = text[i..].find(',').map_or(text.len(), |c| i + c);
                let v = text[i..end].trim();
                i = end;
                v.to_string()
            }
        };

        if !name.is_empty() {
            let value = value.replace(['{', '}'], "");
            fields.insert(name, value.split_whitespace().collect::<Vec<_>>().join(" "));
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, body) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, body).unwrap();
        }
        dir
    }

    const BIB: &str = r#"
@string{jnl = "Journal"}
@article{foo2020,
  title = {Foo {Bar} Results},
  author = "Foo, Alice and Baz, Bob",
  year = 2020,
}
@inproceedings{bar2021,
  title = {Unused Work},
  year = {2021}
}
"#;

    #[test]
    fn test_only_cited_entries_are_kept() {
        let dir = tree(&[
            ("main.tex", "\\section{Intro}\nAs shown in \\cite{foo2020}, things work."),
            ("refs.bib", BIB),
        ]);
        let citations = extract_citations(dir.path());
        let keys: Vec<_> = citations.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["foo2020"]);

        let foo = &citations[0];
        assert_eq!(foo.entry_type, "article");
        assert_eq!(foo.field("title"), Some("Foo Bar Results"));
        assert_eq!(foo.field("author"), Some("Foo, Alice and Baz, Bob"));
        assert_eq!(foo.field("year"), Some("2020"));
    }

    #[test]
    fn test_cite_variants_and_multiple_keys() {
        let dir = tree(&[
            ("sec/intro.tex", "see \\citep[p.~3]{foo2020, bar2021} and \\citeauthor*{baz}"),
            ("refs.bib", BIB),
        ]);
        let keys: Vec<_> = extract_citations(dir.path()).into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["foo2020", "bar2021"]);
    }

    #[test]
    fn test_key_prefix_of_cited_key_matches() {
        let bib = "@misc{foo, title={Short}}\n@misc{foo2020, title={Long}}";
        let dir = tree(&[("main.tex", "\\cite{foo2020}"), ("refs.bib", bib)]);
        let keys: Vec<_> = extract_citations(dir.path()).into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["foo", "foo2020"]);
    }

    #[test]
    fn test_commented_out_citation_is_ignored() {
        let dir = tree(&[("main.tex", "% \\cite{bar2021}\ntext \\cite{foo2020}"), ("refs.bib", BIB)]);
        let keys: Vec<_> = extract_citations(dir.path()).into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["foo2020"]);
    }

    #[test]
    fn test_line_break_before_percent_starts_a_comment() {
        assert_eq!(strip_comments("50\\% done % note"), "50\\% done ");
        assert_eq!(strip_comments("end\\\\% \\cite{bar2021}"), "end\\\\");
        assert_eq!(strip_comments("odd\\\\\\% kept"), "odd\\\\\\% kept");

        let dir = tree(&[
            ("main.tex", "last line\\\\% \\cite{bar2021}\n50\\% via \\cite{foo2020}"),
            ("refs.bib", BIB),
        ]);
        let keys: Vec<_> = extract_citations(dir.path()).into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["foo2020"]);
    }

    #[test]
    fn test_parse_bibtex_reports_malformed_entry() {
        let path = Path::new("refs.bib");
        assert!(matches!(
            parse_bibtex(path, "@article{, title={x}}"),
            Err(ExtractionError::Malformed { .. })
        ));
        let err = parse_bibtex(path, "@article{k, title = {open").unwrap_err();
        assert!(err.to_string().contains("refs.bib"));
    }

    #[test]
    fn test_malformed_bib_is_skipped_without_blocking_others() {
        let dir = tree(&[
            ("main.tex", "\\cite{foo2020,qux}"),
            ("a_broken.bib", "@article{qux, title = {never closed"),
            ("b_refs.bib", BIB),
        ]);
        let keys: Vec<_> = extract_citations(dir.path()).into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["foo2020"]);
    }

    #[test]
    fn test_bbl_entries() {
        let bbl = "\\begin{thebibliography}{9}\n\\bibitem[Foo(2020)]{foo2020}\nA. Foo.\n Foo results.\n\\bibitem{other} Other.\n\\end{thebibliography}";
        let dir = tree(&[("main.tex", "\\cite{foo2020}"), ("main.bbl", bbl)]);
        let citations = extract_citations(dir.path());
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].key, "foo2020");
        assert_eq!(citations[0].field("text"), Some("A. Foo. Foo results."));
    }

    #[test]
    fn test_no_citations_without_tex() {
        let dir = tree(&[("refs.bib", BIB)]);
        assert!(extract_citations(dir.path()).is_empty());
    }

    #[test]
    fn test_sections_across_files() {
        let dir = tree(&[
            (
                "main.tex",
                "\\begin{document}\n\\section{Introduction}\nWe start.\n\\section*{Method}\nWe do.\n\\bibliography{refs}\n\\end{document}",
            ),
            ("appendix.tex", "\\section{Introduction}\nMore intro."),
            ("notes.txt", "\\section{Ignored}"),
        ]);
        let sections = extract_sections(dir.path());
        assert_eq!(sections.len(), 2);
        assert_eq!(sections["Introduction"], "More intro.\n\nWe start.");
        assert_eq!(sections["Method"], "We do.");
    }

    #[test]
    fn test_non_utf8_source_is_read() {
        let dir = TempDir::new().unwrap();
        let mut body = b"\\section{Caf".to_vec();
        body.push(0xe9);
        body.extend_from_slice(b"}\nbody");
        std::fs::write(dir.path().join("main.tex"), body).unwrap();

        let sections = extract_sections(dir.path());
        assert_eq!(sections.get("Café").map(String::as_str), Some("body"));
    }
}
