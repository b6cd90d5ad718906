//! Replication progress records: counters, the state snapshot carried by
//! the controller, and the `_local/<rep_id>` log documents persisted on
//! both peers.

use crate::seq::{Seq, TsSeq};
use crate::task::ReplicationTask;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Monotonic per-run counters. Merged by field-wise addition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStats {
    #[serde(default)]
    pub missing_checked: u64,
    #[serde(default)]
    pub missing_found: u64,
    #[serde(default)]
    pub docs_read: u64,
    #[serde(default)]
    pub docs_written: u64,
    #[serde(default)]
    pub doc_write_failures: u64,
}

impl ReplicationStats {
    pub fn merge(self, other: ReplicationStats) -> ReplicationStats {
        ReplicationStats {
            missing_checked: self.missing_checked + other.missing_checked,
            missing_found: self.missing_found + other.missing_found,
            docs_read: self.docs_read + other.docs_read,
            docs_written: self.docs_written + other.docs_written,
            doc_write_failures: self.doc_write_failures + other.doc_write_failures,
        }
    }
}

/// One replication session summarized in a log's `history`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub recorded_seq: Seq,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub start_last_seq: Seq,
    #[serde(default)]
    pub end_last_seq: Seq,
    #[serde(flatten)]
    pub stats: ReplicationStats,
}

/// The replication log document stored at `_local/<rep_id>` on each peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationLog {
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub source_last_seq: Seq,
    #[serde(default)]
    pub replication_id_version: u8,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Where two peers' replication logs agree: the sequence to resume from and
/// the history to carry forward.
///
/// Matching session ids mean the very last run checkpointed on both sides.
/// Otherwise the two histories are walked pairwise for the most recent
/// session recorded on both. No agreement means starting from scratch.
pub fn compare_replication_logs(
    source: Option<&ReplicationLog>,
    target: Option<&ReplicationLog>,
) -> (Seq, Vec<HistoryEntry>) {
    let (Some(source), Some(target)) = (source, target) else {
        return (Seq::LOWEST, Vec::new());
    };

    if source.session_id == target.session_id {
        (source.source_last_seq.clone(), source.history.clone())
    } else {
        compare_replication_history(&source.history, &target.history)
    }
}

fn compare_replication_history(
    source: &[HistoryEntry],
    target: &[HistoryEntry],
) -> (Seq, Vec<HistoryEntry>) {
    let (Some(source_head), Some(target_head)) = (source.first(), target.first()) else {
        return (Seq::LOWEST, Vec::new());
    };

    if target
        .iter()
        .any(|entry| entry.session_id == source_head.session_id)
    {
        return (source_head.recorded_seq.clone(), source[1..].to_vec());
    }
    if source[1..]
        .iter()
        .any(|entry| entry.session_id == target_head.session_id)
    {
        return (target_head.recorded_seq.clone(), target[1..].to_vec());
    }

    compare_replication_history(&source[1..], &target[1..])
}

/// A snapshot of a replication's identity and progress. The checkpoint loop
/// is the sole writer; everyone else observes whole snapshots.
#[derive(Clone, Debug)]
pub struct ReplicationState {
    pub rep_task: ReplicationTask,

    pub rep_id: String,
    pub rep_uuid: String,
    pub protocol_version: u8,
    /// Fresh per run; correlates history entries across the two logs.
    pub session_id: String,

    /// The source's update seq sampled at run start.
    pub source_seq: Seq,
    pub start_seq: TsSeq,
    /// Last sequence recorded in a checkpoint on both peers.
    pub committed_seq: TsSeq,
    /// Highest sequence below every outstanding claim; what the next
    /// checkpoint will record.
    pub current_through_seq: TsSeq,
    pub highest_seq_done: TsSeq,
    /// Sequences claimed by workers but not yet reported done, ascending.
    pub seqs_in_progress: Vec<TsSeq>,

    pub replication_start_time: OffsetDateTime,
    pub source_start_time: String,
    pub target_start_time: String,
    pub last_checkpoint_made_time: Option<OffsetDateTime>,

    pub source_log_rev: Option<String>,
    pub target_log_rev: Option<String>,
    /// Newest first, capped at fifty entries.
    pub history: Vec<HistoryEntry>,

    pub stats: ReplicationStats,
    /// Unix seconds of the last state update.
    pub timestamp: i64,
}

impl ReplicationState {
    pub fn touch(&mut self) {
        self.timestamp = OffsetDateTime::now_utc().unix_timestamp();
    }
}
