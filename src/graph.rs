use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use serde::Serialize;

use crate::apis::arxiv::canonical_id;
use crate::apis::{CitationEntry, PaperRecord};
use crate::store::PaperStore;

static ARXIV_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)arxiv(?:\.org/(?:abs|pdf))?[:/\s]*(\d{4}\.\d{4,5}|[a-z\-]+(?:\.[a-z]{2})?/\d{7})")
        .expect("valid arXiv reference regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphKind {
    /// Authors linked by shared papers.
    Collaborators,
    /// Papers linked to the works they cite.
    Citations,
}

/// Co-occurrence counts between nodes that appear in the same group.
/// A node's own entry is kept; it is never emitted as an edge.
#[derive(Debug, Clone, Default)]
pub struct Adjacency {
    map: BTreeMap<String, BTreeMap<String, u32>>,
}

impl Adjacency {
    pub fn from_groups<I, G>(groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: IntoIterator<Item = String>,
    {
        let mut map: BTreeMap<String, BTreeMap<String, u32>> = BTreeMap::new();
        for group in groups {
            let members: BTreeSet<String> = group.into_iter().filter(|m| !m.is_empty()).collect();
            for a in &members {
                let row = map.entry(a.clone()).or_default();
                for b in &members {
                    *row.entry(b.clone()).or_default() += 1;
                }
            }
        }
        Self { map }
    }

    pub fn collaborators(papers: &[PaperRecord]) -> Self {
        Self::from_groups(papers.iter().map(|p| p.authors.iter().map(|a| a.trim().to_string())))
    }

    /// Each paper forms a group with the works it cites.
    pub fn citations(papers: &[PaperRecord]) -> Self {
        Self::from_groups(papers.iter().map(|p| {
            std::iter::once(p.id.clone()).chain(p.citations.iter().map(reference_label))
        }))
    }

    pub fn build(kind: GraphKind, papers: &[PaperRecord]) -> Self {
        match kind {
            GraphKind::Collaborators => Self::collaborators(papers),
            GraphKind::Citations => Self::citations(papers),
        }
    }

    pub fn neighbors(&self, node: &str) -> Option<&BTreeMap<String, u32>> {
        self.map.get(node)
    }

    pub fn node_count(&self) -> usize {
        self.map.len()
    }
}

/// Node name for a cited work: its arXiv id when one can be found, else its
/// normalised title, else its bibliography key.
pub fn reference_label(entry: &CitationEntry) -> String {
    if let Some(eprint) = entry.field("eprint").map(str::trim).filter(|e| !e.is_empty()) {
        return canonical_id(eprint);
    }
    for field in ["arxiv", "journal", "note", "url", "howpublished", "text"] {
        if let Some(cap) = entry.field(field).and_then(|v| ARXIV_REF_RE.captures(v)) {
            if let Some(id) = cap.get(1) {
                return canonical_id(id.as_str());
            }
        }
    }
    if let Some(title) = entry.field("title") {
        let normalised = title
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if !normalised.is_empty() {
            return normalised;
        }
    }
    format!("bib:{}", entry.key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Neighborhood {
    pub seed: String,
    pub degree: usize,
    pub nodes: BTreeSet<String>,
    pub edges: Vec<Edge>,
}

/// Breadth-first neighborhood of `seed`.
///
/// Each of the `max_degree` rounds expands every node queued in the previous round.
/// Nodes still queued afterwards (the outer layer) are included but not expanded, so
/// the node set reaches distance `max_degree + 1` while edges are emitted only from
/// expanded nodes. Edges are undirected, listed once, and never self-loops.
pub fn neighborhood_within_degree(seed: &str, max_degree: usize, adjacency: &Adjacency) -> Neighborhood {
    let mut pending: VecDeque<String> = VecDeque::from([seed.to_string()]);
    let mut in_pending: HashSet<String> = HashSet::from([seed.to_string()]);
    let mut visited: HashSet<String> = HashSet::new();
    let mut expanded: Vec<String> = Vec::new();

    for _ in 0..max_degree {
        for _ in 0..pending.len() {
            let Some(node) = pending.pop_front() else {
                break;
            };
            in_pending.remove(&node);
            if !visited.insert(node.clone()) {
                continue;
            }
            if let Some(neighbors) = adjacency.neighbors(&node) {
                for next in neighbors.keys() {
                    if !visited.contains(next) && in_pending.insert(next.clone()) {
                        pending.push_back(next.clone());
                    }
                }
            }
            expanded.push(node);
        }
    }

    let mut nodes: BTreeSet<String> = visited.into_iter().collect();
    nodes.extend(pending);

    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    let mut edges = Vec::new();
    for node in &expanded {
        let Some(neighbors) = adjacency.neighbors(node) else {
            continue;
        };
        for (next, &weight) in neighbors {
            if next == node || !seen.insert((node.as_str(), next.as_str())) {
                continue;
            }
            seen.insert((next.as_str(), node.as_str()));
            edges.push(Edge { source: node.clone(), target: next.clone(), weight });
        }
    }

    Neighborhood {
        seed: seed.to_string(),
        degree: max_degree,
        nodes,
        edges,
    }
}

/// Build the requested graph from every stored paper and query it.
pub async fn neighborhood(
    store: &PaperStore,
    kind: GraphKind,
    seed: &str,
    max_degree: usize,
) -> Result<Neighborhood> {
    let papers = store.all_papers().await?;
    let adjacency = Adjacency::build(kind, &papers);
    let seed = match kind {
        GraphKind::Collaborators => seed.trim().to_string(),
        GraphKind::Citations => canonical_id(seed),
    };
    tracing::debug!("{:?} graph has {} nodes from {} papers", kind, adjacency.node_count(), papers.len());
    Ok(neighborhood_within_degree(&seed, max_degree, &adjacency))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::testing::paper;

    fn entry(key: &str, fields: &[(&str, &str)]) -> CitationEntry {
        CitationEntry {
            key: key.into(),
            entry_type: "misc".into(),
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn chain() -> Adjacency {
        // A - B - C - D - E, plus B - X
        Adjacency::collaborators(&[
            paper("1", &["A", "B"]),
            paper("2", &["B", "C"]),
            paper("3", &["C", "D"]),
            paper("4", &["D", "E"]),
            paper("5", &["B", "X"]),
        ])
    }

    fn edge_pairs(n: &Neighborhood) -> BTreeSet<(String, String)> {
        n.edges
            .iter()
            .map(|e| {
                let (a, b) = if e.source < e.target { (&e.source, &e.target) } else { (&e.target, &e.source) };
                (a.clone(), b.clone())
            })
            .collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_isolated_seed() {
        let n = neighborhood_within_degree("Nobody", 2, &chain());
        assert_eq!(n.nodes, set(&["Nobody"]));
        assert!(n.edges.is_empty());
    }

    #[test]
    fn test_degree_zero_is_seed_only() {
        let n = neighborhood_within_degree("A", 0, &chain());
        assert_eq!(n.nodes, set(&["A"]));
        assert!(n.edges.is_empty());
    }

    #[test]
    fn test_outer_layer_included_without_expansion() {
        let n = neighborhood_within_degree("A", 2, &chain());
        // A and B expanded; C and X are the outer layer; D is out of reach
        assert_eq!(n.nodes, set(&["A", "B", "C", "X"]));
        let expected: BTreeSet<(String, String)> = [("A", "B"), ("B", "C"), ("B", "X")]
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect();
        assert_eq!(edge_pairs(&n), expected);
    }

    #[test]
    fn test_edges_are_unique_and_without_self_loops() {
        let adjacency = Adjacency::collaborators(&[
            paper("1", &["A", "B", "C"]),
            paper("2", &["A", "B"]),
        ]);
        let n = neighborhood_within_degree("A", 3, &adjacency);
        assert_eq!(n.nodes, set(&["A", "B", "C"]));
        assert_eq!(n.edges.len(), 3);
        assert!(n.edges.iter().all(|e| e.source != e.target));

        let ab = n
            .edges
            .iter()
            .find(|e| (e.source == "A" && e.target == "B") || (e.source == "B" && e.target == "A"))
            .unwrap();
        assert_eq!(ab.weight, 2);
    }

    #[test]
    fn test_citation_graph_links_papers_through_shared_references() {
        let mut p1 = paper("2301.00001", &["A"]);
        p1.citations = vec![
            entry("vaswani", &[("journal", "arXiv preprint arXiv:1706.03762")]),
            entry("old", &[("title", "An Old {Result}")]),
        ];
        let mut p2 = paper("2301.00002", &["B"]);
        p2.citations = vec![entry("attn", &[("eprint", "1706.03762v5")])];

        let adjacency = Adjacency::citations(&[p1, p2]);
        let n = neighborhood_within_degree("2301.00002", 2, &adjacency);
        // the other citing paper is reached through the shared reference but not expanded
        assert_eq!(n.nodes, set(&["2301.00002", "1706.03762", "2301.00001"]));

        let wider = neighborhood_within_degree("2301.00002", 3, &adjacency);
        assert!(wider.nodes.contains("an old result"));
    }

    #[test]
    fn test_reference_label_fallbacks() {
        assert_eq!(reference_label(&entry("k", &[("url", "https://arxiv.org/abs/hep-th/9901001v2")])), "hep-th/9901001");
        assert_eq!(reference_label(&entry("k", &[("title", "  Deep   Learning! ")])), "deep learning");
        assert_eq!(reference_label(&entry("k", &[])), "bib:k");
    }
}
