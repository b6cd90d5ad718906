//! The replication controller: startup sequence, subtask supervision, and
//! the public entry point of the engine.

use crate::changes::changes_reader_loop;
use crate::checkpoint::{checkpoints_loop, Report};
use crate::peer::{DatabaseInfo, SourcePeer, TargetPeer};
use crate::queue::WorkQueue;
use crate::rep_id;
use crate::seq::{Seq, TsSeq};
use crate::state::{compare_replication_logs, ReplicationLog, ReplicationState, ReplicationStats};
use crate::task::ReplicationTask;
use crate::worker::ReplicationWorker;
use crate::{Error, Result};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// The one replication protocol version this engine speaks, matching
/// CouchDB 1.2 and later.
pub const PROTOCOL_VERSION: u8 = 3;

/// A single replication job. Construct it with verified configuration and
/// drive it to completion with [`Replication::run`].
pub struct Replication {
    rep_uuid: String,
    task: ReplicationTask,
    source: Arc<dyn SourcePeer>,
    target: Arc<dyn TargetPeer>,
    state_tx: watch::Sender<Option<ReplicationState>>,
    state_rx: watch::Receiver<Option<ReplicationState>>,
}

/// Exit of one supervised subtask.
enum Exit {
    Reader(Result<()>),
    Worker {
        worker_id: String,
        result: Result<()>,
    },
    Checkpoints(Result<ReplicationState>),
}

impl Replication {
    /// Build a replication job from its task. `rep_uuid` identifies this
    /// replicator instance and feeds into the replication id, so it must be
    /// stable across restarts for checkpoints to be found again.
    pub fn new(
        rep_uuid: impl Into<String>,
        task: ReplicationTask,
        source: Arc<dyn SourcePeer>,
        target: Arc<dyn TargetPeer>,
    ) -> Result<Self> {
        let task = task.validate()?;
        let (state_tx, state_rx) = watch::channel(None);
        Ok(Replication {
            rep_uuid: rep_uuid.into(),
            task,
            source,
            target,
            state_tx,
            state_rx,
        })
    }

    /// Observe state snapshots as the run progresses. Holds `None` until
    /// startup completes.
    pub fn subscribe(&self) -> watch::Receiver<Option<ReplicationState>> {
        self.state_rx.clone()
    }

    /// Run the replication to completion and return the final state.
    ///
    /// A non-continuous run finishes once the change feed is drained and
    /// the final checkpoint is recorded. A continuous run only returns on
    /// error or when the future is dropped.
    pub async fn run(self) -> Result<ReplicationState> {
        let Replication {
            rep_uuid,
            task,
            source,
            target,
            state_tx,
            state_rx: _,
        } = self;

        tracing::info!(
            source = %task.source.url,
            target = %task.target.url,
            "starting replication"
        );

        let (source_info, target_info) =
            verify_peers(&*source, &*target, task.create_target).await?;
        let rep_id =
            generate_replication_id(&task, &*source, &rep_uuid, PROTOCOL_VERSION).await?;

        let (source_log, target_log) = find_replication_logs(&rep_id, &*source, &*target).await?;
        let (found_seq, history) =
            compare_replication_logs(source_log.as_ref(), target_log.as_ref());

        if task.since_seq.is_none() && found_seq == Seq::LOWEST {
            tracing::debug!(rep_id = %rep_id, "no common ancestry, performing full replication");
        } else {
            tracing::debug!(
                rep_id = %rep_id,
                seq = %found_seq,
                "found a common replication record"
            );
        }
        let start_seq = TsSeq::start(task.since_seq.clone().unwrap_or(found_seq));
        tracing::debug!(rep_id = %rep_id, start_seq = %start_seq.id, "replication start sequence");

        let mut state = ReplicationState {
            rep_id: rep_id.clone(),
            rep_uuid,
            protocol_version: PROTOCOL_VERSION,
            session_id: uuid::Uuid::new_v4().simple().to_string(),

            source_seq: source_info.update_seq,
            start_seq: start_seq.clone(),
            committed_seq: start_seq.clone(),
            current_through_seq: start_seq.clone(),
            highest_seq_done: start_seq.clone(),
            seqs_in_progress: Vec::new(),

            replication_start_time: OffsetDateTime::now_utc(),
            source_start_time: source_info.instance_start_time,
            target_start_time: target_info.instance_start_time,
            last_checkpoint_made_time: None,

            source_log_rev: source_log.and_then(|log| log.rev),
            target_log_rev: target_log.and_then(|log| log.rev),
            history,

            stats: ReplicationStats::default(),
            timestamp: 0,
            rep_task: task.clone(),
        };
        state.touch();
        let _ = state_tx.send(Some(state.clone()));

        let changes_queue: WorkQueue<_> =
            WorkQueue::bounded(task.worker_processes * task.worker_batch_size * 2);
        let reports_queue: WorkQueue<Report> = WorkQueue::unbounded();

        let mut tasks: JoinSet<Exit> = JoinSet::new();
        tasks.spawn({
            let source = source.clone();
            let task = task.clone();
            let changes_queue = changes_queue.clone();
            let reports_queue = reports_queue.clone();
            let start_seq = start_seq.clone();
            async move {
                Exit::Reader(
                    changes_reader_loop(source, task, start_seq, changes_queue, reports_queue)
                        .await,
                )
            }
        });
        tasks.spawn({
            let source = source.clone();
            let target = target.clone();
            let reports_queue = reports_queue.clone();
            async move {
                Exit::Checkpoints(
                    checkpoints_loop(state, reports_queue, source, target, state_tx).await,
                )
            }
        });
        for _ in 0..task.worker_processes {
            let worker = ReplicationWorker::new(
                rep_id.clone(),
                source.clone(),
                target.clone(),
                changes_queue.clone(),
                reports_queue.clone(),
                task.worker_batch_size,
                task.http_connections,
            );
            let worker_id = worker.id().to_string();
            tasks.spawn(async move {
                Exit::Worker {
                    worker_id,
                    result: worker.run().await,
                }
            });
        }

        supervise(&rep_id, tasks, reports_queue, task.worker_processes).await
    }
}

/// Verify both databases exist and are reachable, creating the target on
/// request. Any error here fails startup.
async fn verify_peers(
    source: &dyn SourcePeer,
    target: &dyn TargetPeer,
    create_target: bool,
) -> Result<(DatabaseInfo, DatabaseInfo)> {
    let source_info = source.info().await?;
    if !target.exists().await? && create_target {
        target.create().await?;
    }
    let target_info = target.info().await?;
    Ok((source_info, target_info))
}

/// Derive the v3 replication id, fetching the source text of a stored
/// filter function when the task names one.
async fn generate_replication_id(
    task: &ReplicationTask,
    source: &dyn SourcePeer,
    rep_uuid: &str,
    protocol_version: u8,
) -> Result<String> {
    if protocol_version != PROTOCOL_VERSION {
        return Err(Error::Config(format!(
            "unsupported replication protocol version {protocol_version}: only version {PROTOCOL_VERSION} is supported"
        )));
    }
    let filter_code = source
        .get_filter_function_code(task.filter.as_deref())
        .await?;
    rep_id::v3(rep_uuid, task, filter_code.as_deref())
}

async fn find_replication_logs(
    rep_id: &str,
    source: &dyn SourcePeer,
    target: &dyn TargetPeer,
) -> Result<(Option<ReplicationLog>, Option<ReplicationLog>)> {
    let source_log = source.get_replication_log(rep_id).await?;
    let target_log = target.get_replication_log(rep_id).await?;
    Ok((source_log, target_log))
}

/// Monitor subtasks for their exit status per the supervisor rules: the
/// first failure cancels all siblings and becomes the run's error; once all
/// workers finish cleanly, the reports queue closes and the checkpoint
/// loop's final state is the run's result.
async fn supervise(
    rep_id: &str,
    mut tasks: JoinSet<Exit>,
    reports_queue: WorkQueue<Report>,
    worker_count: usize,
) -> Result<ReplicationState> {
    let mut workers_running = worker_count;
    let mut final_state = None;

    while let Some(joined) = tasks.join_next().await {
        let exit = match joined {
            Ok(exit) => exit,
            Err(err) => {
                tracing::error!(rep_id, error = %err, "replication subtask aborted");
                tasks.abort_all();
                return Err(Error::UnexpectedStop("replication subtask"));
            }
        };

        match exit {
            Exit::Reader(Ok(())) => (),
            Exit::Reader(Err(err)) => {
                tracing::error!(rep_id, error = %err, "changes reader died");
                tasks.abort_all();
                return Err(err);
            }
            Exit::Worker {
                worker_id,
                result: Err(err),
            } => {
                tracing::error!(rep_id, worker_id = %worker_id, error = %err, "worker died");
                tasks.abort_all();
                return Err(err);
            }
            Exit::Worker { result: Ok(()), .. } => {
                workers_running -= 1;
                if workers_running == 0 {
                    // All done: ask for the last checkpoint.
                    reports_queue.close();
                }
            }
            Exit::Checkpoints(result) if workers_running > 0 => {
                tasks.abort_all();
                return match result {
                    Err(err) => {
                        tracing::error!(rep_id, error = %err, "checkpoints loop died");
                        Err(err)
                    }
                    Ok(_) => {
                        tracing::error!(rep_id, "checkpoints loop unexpectedly stopped");
                        Err(Error::UnexpectedStop("checkpoints loop"))
                    }
                };
            }
            Exit::Checkpoints(Ok(state)) => final_state = Some(state),
            Exit::Checkpoints(Err(err)) => {
                tracing::error!(rep_id, error = %err, "checkpoints loop died");
                tasks.abort_all();
                return Err(err);
            }
        }
    }

    final_state.ok_or(Error::UnexpectedStop("checkpoints loop"))
}
