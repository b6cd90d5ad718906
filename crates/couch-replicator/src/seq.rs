use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Update sequence emitted by a source's change feed.
///
/// Single-node servers emit integers while clustered ones emit opaque
/// strings. The engine never interprets the value: it only threads it back
/// into `since=` requests and persists it in checkpoints.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seq {
    Number(u64),
    Text(String),
}

impl Seq {
    /// The sequence replication starts from when no checkpoint is found.
    pub const LOWEST: Seq = Seq::Number(0);
}

impl Default for Seq {
    fn default() -> Self {
        Seq::LOWEST
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seq::Number(n) => n.fmt(f),
            Seq::Text(s) => s.fmt(f),
        }
    }
}

impl From<u64> for Seq {
    fn from(n: u64) -> Self {
        Seq::Number(n)
    }
}

impl From<&str> for Seq {
    fn from(s: &str) -> Self {
        Seq::Text(s.to_string())
    }
}

impl From<String> for Seq {
    fn from(s: String) -> Self {
        Seq::Text(s)
    }
}

// Sequence ids have no meaningful order of their own. This arbitrary but
// total order exists solely so that `TsSeq` can tie-break equal timestamps.
impl Ord for Seq {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Seq::Number(l), Seq::Number(r)) => l.cmp(r),
            (Seq::Text(l), Seq::Text(r)) => l.cmp(r),
            (Seq::Number(_), Seq::Text(_)) => Ordering::Less,
            (Seq::Text(_), Seq::Number(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A source sequence stamped with the changes reader's monotonic counter.
///
/// Progress markers are compared by `(ts, id)`: the `ts` component supplies
/// the total order which the opaque ids lack, and only the `id` component is
/// ever persisted to checkpoints.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TsSeq {
    pub ts: u64,
    pub id: Seq,
}

impl TsSeq {
    pub fn new(ts: u64, id: impl Into<Seq>) -> Self {
        TsSeq { ts, id: id.into() }
    }

    /// The marker a run starts from: ts zero, carrying the recovered or
    /// requested source sequence.
    pub fn start(id: Seq) -> Self {
        TsSeq { ts: 0, id }
    }
}

impl fmt::Display for TsSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.ts)
    }
}
