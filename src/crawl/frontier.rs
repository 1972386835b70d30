use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned by [`Frontier::dequeue`] once nothing is queued. Signals a finished
/// crawl rather than a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("frontier is empty")]
pub struct EmptyFrontier;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontierMode {
    #[default]
    Fifo,
    Priority,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown frontier mode '{0}' (expected fifo or priority)")]
pub struct UnknownFrontierMode(pub String);

impl FromStr for FrontierMode {
    type Err = UnknownFrontierMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "priority" => Ok(Self::Priority),
            _ => Err(UnknownFrontierMode(s.trim().to_string())),
        }
    }
}

impl fmt::Display for FrontierMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fifo => f.write_str("fifo"),
            Self::Priority => f.write_str("priority"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontierEntry {
    pub name: String,
    pub score: i64,
    pub seq: u64,
}

// Highest score first, then earliest insertion.
impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
enum Queue {
    Fifo(VecDeque<FrontierEntry>),
    Priority(BinaryHeap<FrontierEntry>),
}

/// Serializable frontier contents, entries in dequeue order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontierSnapshot {
    pub mode: FrontierMode,
    pub next_seq: u64,
    pub entries: Vec<FrontierEntry>,
}

/// Author work queue plus the visited set. A name is never both queued and visited.
#[derive(Debug, Clone)]
pub struct Frontier {
    queue: Queue,
    queued: HashSet<String>,
    visited: HashSet<String>,
    next_seq: u64,
}

impl Frontier {
    pub fn new(mode: FrontierMode) -> Self {
        let queue = match mode {
            FrontierMode::Fifo => Queue::Fifo(VecDeque::new()),
            FrontierMode::Priority => Queue::Priority(BinaryHeap::new()),
        };
        Self {
            queue,
            queued: HashSet::new(),
            visited: HashSet::new(),
            next_seq: 0,
        }
    }

    pub fn mode(&self) -> FrontierMode {
        match self.queue {
            Queue::Fifo(_) => FrontierMode::Fifo,
            Queue::Priority(_) => FrontierMode::Priority,
        }
    }

    /// Queue `name` unless it is already queued or visited. Returns whether it was added.
    /// The score is ignored in FIFO mode.
    pub fn enqueue(&mut self, name: &str, score: i64) -> bool {
        if self.visited.contains(name) || self.queued.contains(name) {
            return false;
        }
        let entry = FrontierEntry {
            name: name.to_string(),
            score,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.push(entry);
        true
    }

    fn push(&mut self, entry: FrontierEntry) {
        self.queued.insert(entry.name.clone());
        match &mut self.queue {
            Queue::Fifo(q) => q.push_back(entry),
            Queue::Priority(h) => h.push(entry),
        }
    }

    pub fn dequeue(&mut self) -> Result<String, EmptyFrontier> {
        let entry = match &mut self.queue {
            Queue::Fifo(q) => q.pop_front(),
            Queue::Priority(h) => h.pop(),
        }
        .ok_or(EmptyFrontier)?;
        self.queued.remove(&entry.name);
        Ok(entry.name)
    }

    /// Idempotent. Also drops `name` from the queue if it is still waiting there.
    pub fn mark_visited(&mut self, name: &str) {
        if self.queued.remove(name) {
            match &mut self.queue {
                Queue::Fifo(q) => q.retain(|e| e.name != name),
                Queue::Priority(h) => h.retain(|e| e.name != name),
            }
        }
        self.visited.insert(name.to_string());
    }

    pub fn is_visited(&self, name: &str) -> bool {
        self.visited.contains(name)
    }

    pub fn is_queued(&self, name: &str) -> bool {
        self.queued.contains(name)
    }

    /// True if `name` would be accepted by [`Frontier::enqueue`].
    pub fn is_new(&self, name: &str) -> bool {
        !self.is_visited(name) && !self.is_queued(name)
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    pub fn snapshot(&self) -> FrontierSnapshot {
        let entries = match &self.queue {
            Queue::Fifo(q) => q.iter().cloned().collect(),
            Queue::Priority(h) => {
                let mut v = h.clone().into_sorted_vec();
                v.reverse();
                v
            }
        };
        FrontierSnapshot {
            mode: self.mode(),
            next_seq: self.next_seq,
            entries,
        }
    }

    /// Sorted for stable checkpoint output.
    pub fn visited_snapshot(&self) -> Vec<String> {
        let mut v: Vec<String> = self.visited.iter().cloned().collect();
        v.sort();
        v
    }

    /// Rebuild a frontier from a snapshot and visited list. Entries that are already
    /// visited, or repeated, are dropped so the invariant holds after restore.
    pub fn restore(snapshot: FrontierSnapshot, visited: Vec<String>) -> Self {
        let mut frontier = Self::new(snapshot.mode);
        frontier.visited = visited.into_iter().collect();
        let mut max_seq = snapshot.next_seq;
        for entry in snapshot.entries {
            if frontier.visited.contains(&entry.name) || frontier.queued.contains(&entry.name) {
                tracing::warn!("Dropping inconsistent checkpoint entry for {}", entry.name);
                continue;
            }
            max_seq = max_seq.max(entry.seq + 1);
            frontier.push(entry);
        }
        frontier.next_seq = max_seq;
        frontier
    }
}
