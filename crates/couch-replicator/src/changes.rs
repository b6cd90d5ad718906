//! Changes reader: the single producer of the changes queue.
//!
//! The reader stamps every feed event with a monotonically increasing `ts`,
//! giving the checkpoint loop a total order over progress markers even when
//! the source's opaque sequence ids have none.

use crate::checkpoint::Report;
use crate::peer::{ChangeEvent, ChangesOptions, FeedItem, SourcePeer};
use crate::queue::WorkQueue;
use crate::seq::TsSeq;
use crate::state::ReplicationStats;
use crate::task::ReplicationTask;
use crate::{Error, Result};
use std::sync::Arc;

/// The feed subtask must not outlive the reader, even when the supervisor
/// aborts us mid-drain.
struct AbortOnDrop<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) async fn changes_reader_loop(
    source: Arc<dyn SourcePeer>,
    task: ReplicationTask,
    start_seq: TsSeq,
    changes_queue: WorkQueue<(TsSeq, ChangeEvent)>,
    reports_queue: WorkQueue<Report>,
) -> Result<()> {
    let inbox: WorkQueue<FeedItem> = match changes_queue.capacity() {
        Some(capacity) => WorkQueue::bounded(capacity),
        None => WorkQueue::unbounded(),
    };
    let options = ChangesOptions {
        continuous: task.continuous,
        doc_ids: task.doc_ids.clone(),
        filter: task.filter.clone(),
        query_params: task.query_params.as_ref().map(|params| params.pairs()),
        since: start_seq.id.clone(),
        view: task.view.clone(),
    };

    let mut feed = AbortOnDrop(tokio::spawn({
        let source = source.clone();
        let inbox = inbox.clone();
        async move { source.changes(inbox, options).await }
    }));
    let mut feed_running = true;

    let mut ts = start_seq.ts;
    loop {
        let next = if feed_running {
            tokio::select! {
                items = inbox.get(1) => items,
                // The feed operation is expected to have retried whatever
                // it could before giving up, so its failure is ours as well.
                result = &mut feed.0 => {
                    match result {
                        Ok(Ok(())) => {
                            // Remaining items (the last_seq marker included)
                            // stay buffered; closing terminates the drain.
                            inbox.close();
                            feed_running = false;
                            continue;
                        }
                        Ok(Err(err)) => return Err(err),
                        Err(_) => return Err(Error::UnexpectedStop("changes feed")),
                    }
                }
            }
        } else {
            inbox.get(1).await
        };
        let (seq, event) = match next {
            Some(mut items) => items.remove(0),
            // The feed returned without pushing its last_seq marker.
            None => return Err(Error::TruncatedFeed),
        };
        ts += 1;

        match event {
            Some(event) => {
                changes_queue
                    .put((TsSeq::new(ts, seq), event))
                    .await
                    .map_err(|_| Error::QueueClosed)?;
            }
            None => {
                // Report the last seq even though no worker will ever touch
                // it. With a filtered feed the workers may stop far short of
                // the sequence the feed actually read through, and resuming
                // from here avoids re-reading all of it next run.
                let last_seq = TsSeq::new(ts, seq);
                tracing::debug!(last_seq = %last_seq, "changes feed ended");
                reports_queue
                    .put(Report::completed(last_seq, ReplicationStats::default()))
                    .await
                    .map_err(|_| Error::QueueClosed)?;
                changes_queue.close();
                return Ok(());
            }
        }
    }
}
