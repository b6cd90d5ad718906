//! Replication worker: moves batches of changed documents from the source
//! to the target.

use crate::checkpoint::Report;
use crate::peer::{ChangeEvent, DiffEntry, SourcePeer, TargetPeer};
use crate::queue::WorkQueue;
use crate::seq::TsSeq;
use crate::state::ReplicationStats;
use crate::{Error, Result};
use futures::{StreamExt, TryStreamExt};
use indexmap::IndexMap;
use std::pin::pin;
use std::sync::Arc;

/// Documents without attachments are buffered and flushed in bulk once this
/// many accumulate (or at end of batch). Attachment-bearing documents are
/// streamed through individually and never mix with the buffer.
const BULK_FLUSH_THRESHOLD: usize = 100;

pub struct ReplicationWorker {
    id: String,
    rep_id: String,
    source: Arc<dyn SourcePeer>,
    target: Arc<dyn TargetPeer>,
    changes_queue: WorkQueue<(TsSeq, ChangeEvent)>,
    reports_queue: WorkQueue<Report>,
    batch_size: usize,
    max_conns: usize,
}

impl ReplicationWorker {
    pub fn new(
        rep_id: String,
        source: Arc<dyn SourcePeer>,
        target: Arc<dyn TargetPeer>,
        changes_queue: WorkQueue<(TsSeq, ChangeEvent)>,
        reports_queue: WorkQueue<Report>,
        batch_size: usize,
        max_conns: usize,
    ) -> Self {
        ReplicationWorker {
            id: hex::encode(rand::random::<[u8; 4]>()),
            rep_id,
            source,
            target,
            changes_queue,
            reports_queue,
            batch_size: batch_size.max(1),
            max_conns: max_conns.max(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pull and replicate batches until the changes queue closes.
    ///
    /// Each batch emits exactly one claim report followed by exactly one
    /// done report, both carrying the batch's highest sequence.
    pub async fn run(self) -> Result<()> {
        loop {
            let Some(mut batch) = self.changes_queue.get(self.batch_size).await else {
                tracing::debug!(rep_id = %self.rep_id, worker_id = %self.id, "worker done");
                return Ok(());
            };
            // Multiple producers could have raced the queue; report order
            // relies on the batch being sorted.
            batch.sort_by(|(left, _), (right, _)| left.cmp(right));
            let report_seq = batch.last().expect("batches are never empty").0.clone();

            tracing::debug!(
                rep_id = %self.rep_id,
                worker_id = %self.id,
                batch = batch.len(),
                first = %batch[0].0,
                last = %report_seq,
                "received batch"
            );

            self.reports_queue
                .put(Report::claimed(report_seq.clone()))
                .await
                .map_err(|_| Error::QueueClosed)?;

            let stats = self.replicate_batch(batch).await?;

            self.reports_queue
                .put(Report::completed(report_seq, stats))
                .await
                .map_err(|_| Error::QueueClosed)?;
        }
    }

    async fn replicate_batch(&self, batch: Vec<(TsSeq, ChangeEvent)>) -> Result<ReplicationStats> {
        let mut stats = ReplicationStats::default();

        // Fold the batch into doc → unique revisions, keeping feed order.
        let mut id_revs: IndexMap<String, Vec<String>> = IndexMap::new();
        for (_, event) in &batch {
            let revs = id_revs.entry(event.id.clone()).or_default();
            for change in &event.changes {
                if !revs.contains(&change.rev) {
                    revs.push(change.rev.clone());
                }
            }
        }
        stats.missing_checked = id_revs.values().map(|revs| revs.len() as u64).sum();

        let diff = self.target.revs_diff(id_revs).await?;
        let missing: Vec<(String, DiffEntry)> = diff
            .into_iter()
            .filter(|(_, entry)| !entry.missing.is_empty())
            .collect();
        stats.missing_found = missing
            .iter()
            .map(|(_, entry)| entry.missing.len() as u64)
            .sum();

        let mut buffer: Vec<serde_json::Value> = Vec::new();
        let bulk_threshold = self.batch_size.min(BULK_FLUSH_THRESHOLD);

        let mut revisions = pin!(futures::stream::iter(missing.into_iter().map(
            |(doc_id, entry)| {
                let source = self.source.clone();
                async move {
                    source
                        .open_doc_revs(
                            &doc_id,
                            &entry.missing,
                            &entry.possible_ancestors,
                            true,
                            true,
                        )
                        .await
                }
            }
        ))
        .buffer_unordered(self.max_conns)
        .try_flatten_unordered(self.max_conns));

        while let Some(revision) = revisions.try_next().await? {
            match revision.attachments {
                Some(attachments) => {
                    // Attachments stream straight through to the target,
                    // without ever materializing in memory.
                    stats.docs_read += 1;
                    match self.target.update_doc(revision.body, attachments).await? {
                        Some(failure) => {
                            tracing::warn!(
                                rep_id = %self.rep_id,
                                worker_id = %self.id,
                                error = %failure.error,
                                reason = %failure.reason,
                                "target rejected document"
                            );
                            stats.doc_write_failures += 1;
                        }
                        None => stats.docs_written += 1,
                    }
                }
                None => {
                    buffer.push(serde_json::from_slice(&revision.body)?);
                    if buffer.len() >= bulk_threshold {
                        self.flush_bulk(&mut buffer, &mut stats).await?;
                    }
                }
            }
        }
        self.flush_bulk(&mut buffer, &mut stats).await?;

        Ok(stats)
    }

    async fn flush_bulk(
        &self,
        buffer: &mut Vec<serde_json::Value>,
        stats: &mut ReplicationStats,
    ) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let docs = std::mem::take(buffer);
        let buffered = docs.len() as u64;

        let failures = self.target.update_docs(docs).await?;
        for failure in &failures {
            tracing::warn!(
                rep_id = %self.rep_id,
                worker_id = %self.id,
                doc_id = %failure.id,
                error = %failure.error,
                reason = %failure.reason,
                "target rejected bulk document"
            );
        }

        stats.docs_read += buffered;
        stats.doc_write_failures += failures.len() as u64;
        stats.docs_written += buffered - failures.len() as u64;
        Ok(())
    }
}
