//! Progress aggregation and the crash-safe checkpoint protocol.
//!
//! Workers claim the highest sequence of each batch before touching it and
//! confirm it once the batch is durably applied. The loop here advances the
//! *through sequence*, the highest sequence below every outstanding claim,
//! and periodically records it on both peers as `_local/<rep_id>` documents.

use crate::peer::{SourcePeer, TargetPeer};
use crate::queue::WorkQueue;
use crate::seq::TsSeq;
use crate::state::{HistoryEntry, ReplicationLog, ReplicationState, ReplicationStats};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::watch;

/// A checkpoint log keeps the new entry plus at most this many prior ones.
pub const MAX_HISTORY_ENTRIES: usize = 50;

/// A worker's progress report: a claim on a batch's highest sequence, or
/// its completion carrying the batch's stats delta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub done: bool,
    pub seq: TsSeq,
    pub stats: ReplicationStats,
}

impl Report {
    pub fn claimed(seq: TsSeq) -> Self {
        Report {
            done: false,
            seq,
            stats: ReplicationStats::default(),
        }
    }

    pub fn completed(seq: TsSeq, stats: ReplicationStats) -> Self {
        Report {
            done: true,
            seq,
            stats,
        }
    }
}

/// Drain worker reports, gate the through sequence on the lowest
/// outstanding claim, and checkpoint on a timer. Runs until the reports
/// queue closes, then records the final checkpoint and returns the final
/// state.
pub(crate) async fn checkpoints_loop(
    mut state: ReplicationState,
    reports_queue: WorkQueue<Report>,
    source: Arc<dyn SourcePeer>,
    target: Arc<dyn TargetPeer>,
    state_tx: watch::Sender<Option<ReplicationState>>,
) -> Result<ReplicationState> {
    let interval = Duration::from_secs(state.rep_task.checkpoint_interval.max(1));
    let mut timer = Box::pin(tokio::time::sleep(interval));

    loop {
        tokio::select! {
            reports = reports_queue.get_all() => {
                let Some(reports) = reports else {
                    // All workers are done and their claims must be too.
                    assert!(
                        state.seqs_in_progress.is_empty(),
                        "reports queue closed with sequences still in progress: {:?}",
                        state.seqs_in_progress,
                    );
                    state = maybe_checkpoint(state, &*source, &*target).await?;
                    tracing::info!(
                        rep_id = %state.rep_id,
                        committed_seq = %state.committed_seq,
                        "last checkpoint made"
                    );
                    let _ = state_tx.send(Some(state.clone()));
                    return Ok(state);
                };
                for report in reports {
                    if report.done {
                        handle_seq_done(&mut state, report);
                    } else {
                        handle_seq_claim(&mut state, report.seq);
                    }
                }
                state.touch();
                let _ = state_tx.send(Some(state.clone()));
            }
            () = &mut timer => {
                state = maybe_checkpoint(state, &*source, &*target).await?;
                let _ = state_tx.send(Some(state.clone()));
                timer.as_mut().reset(tokio::time::Instant::now() + interval);
            }
        }
    }
}

fn handle_seq_claim(state: &mut ReplicationState, seq: TsSeq) {
    tracing::debug!(rep_id = %state.rep_id, %seq, "worker claimed seq");
    let index = match state.seqs_in_progress.binary_search(&seq) {
        Ok(index) | Err(index) => index,
    };
    state.seqs_in_progress.insert(index, seq);
}

fn handle_seq_done(state: &mut ReplicationState, report: Report) {
    if report.seq > state.highest_seq_done {
        state.highest_seq_done = report.seq.clone();
    }

    // Progress is gated on the minimum outstanding claim: with workers
    // processing disjoint batches out of order, the through sequence may
    // only advance once every batch below it has been confirmed.
    if !state.seqs_in_progress.is_empty() {
        if state.seqs_in_progress[0] == report.seq {
            state.current_through_seq = state.seqs_in_progress.remove(0);
        } else if let Ok(index) = state.seqs_in_progress.binary_search(&report.seq) {
            // The reader's final last_seq report was never claimed, hence
            // the guard against an absent entry.
            state.seqs_in_progress.remove(index);
        }
    }
    if state.seqs_in_progress.is_empty() && state.highest_seq_done > state.current_through_seq {
        state.current_through_seq = state.highest_seq_done.clone();
    }

    state.stats = state.stats.merge(report.stats);
    tracing::debug!(
        rep_id = %state.rep_id,
        seq = %report.seq,
        through_seq = %state.current_through_seq,
        in_progress = state.seqs_in_progress.len(),
        "worker reported seq done"
    );
}

async fn maybe_checkpoint(
    state: ReplicationState,
    source: &dyn SourcePeer,
    target: &dyn TargetPeer,
) -> Result<ReplicationState> {
    if !state.rep_task.use_checkpoints {
        return Ok(state);
    }
    if state.committed_seq == state.current_through_seq {
        // No progress since the last checkpoint.
        return Ok(state);
    }
    do_checkpoint(state, source, target).await
}

async fn do_checkpoint(
    state: ReplicationState,
    source: &dyn SourcePeer,
    target: &dyn TargetPeer,
) -> Result<ReplicationState> {
    ensure_full_commit(&state, source, target).await?;
    record_checkpoint(state, source, target).await
}

/// Ask both peers to flush to durable storage, and fail the replication if
/// either reports an instance start time other than the one sampled at run
/// start: a restarted peer may have lost unflushed writes this run already
/// accounted for.
async fn ensure_full_commit(
    state: &ReplicationState,
    source: &dyn SourcePeer,
    target: &dyn TargetPeer,
) -> Result<()> {
    let source_start_time = source.ensure_full_commit().await?;
    let target_start_time = target.ensure_full_commit().await?;

    if source_start_time != state.source_start_time {
        return Err(Error::PeerRestarted { peer: "source" });
    }
    if target_start_time != state.target_start_time {
        return Err(Error::PeerRestarted { peer: "target" });
    }
    Ok(())
}

async fn record_checkpoint(
    mut state: ReplicationState,
    source: &dyn SourcePeer,
    target: &dyn TargetPeer,
) -> Result<ReplicationState> {
    let log = new_replication_log(&state);

    let source_rev = source
        .update_replication_log(&state.rep_id, &log, state.source_log_rev.as_deref())
        .await?;
    let target_rev = target
        .update_replication_log(&state.rep_id, &log, state.target_log_rev.as_deref())
        .await?;

    tracing::info!(
        rep_id = %state.rep_id,
        seq = %state.current_through_seq,
        "checkpoint recorded"
    );

    state.committed_seq = state.current_through_seq.clone();
    state.history = log.history;
    state.last_checkpoint_made_time = Some(OffsetDateTime::now_utc());
    state.source_log_rev = Some(source_rev);
    state.target_log_rev = Some(target_rev);
    state.touch();
    Ok(state)
}

fn new_replication_log(state: &ReplicationState) -> ReplicationLog {
    let mut history = Vec::with_capacity(MAX_HISTORY_ENTRIES);
    history.push(new_history_entry(state));
    history.extend(
        state
            .history
            .iter()
            .take(MAX_HISTORY_ENTRIES - 1)
            .cloned(),
    );

    ReplicationLog {
        rev: None,
        session_id: state.session_id.clone(),
        source_last_seq: state.current_through_seq.id.clone(),
        replication_id_version: state.protocol_version,
        history,
    }
}

fn new_history_entry(state: &ReplicationState) -> HistoryEntry {
    HistoryEntry {
        session_id: state.session_id.clone(),
        recorded_seq: state.current_through_seq.id.clone(),
        start_time: format_time(state.replication_start_time),
        end_time: format_time(OffsetDateTime::now_utc()),
        start_last_seq: state.committed_seq.id.clone(),
        end_last_seq: state.current_through_seq.id.clone(),
        stats: state.stats,
    }
}

const TIME_FORMAT: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// RFC 1123 with a literal GMT zone, the format CouchDB records in
/// replication histories.
pub fn format_time(at: OffsetDateTime) -> String {
    at.to_offset(time::UtcOffset::UTC)
        .format(&TIME_FORMAT)
        .expect("the time format is static and infallible")
}
