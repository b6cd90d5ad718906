//! End-to-end replication scenarios against in-memory peers.

use bytes::Bytes;
use couch_replicator::peer::{
    AttachmentsReader, ChangeEvent, ChangesOptions, DatabaseInfo, DiffEntry, DocRevision,
    FeedItem, Peer, RevisionRef, SourcePeer, TargetPeer, WriteFailure,
};
use couch_replicator::queue::WorkQueue;
use couch_replicator::seq::Seq;
use couch_replicator::state::{ReplicationLog, ReplicationStats};
use couch_replicator::task::{PeerInfo, ReplicationTask};
use couch_replicator::{Error, Replication, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use indexmap::IndexMap;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct DbState {
    exists: bool,
    update_seq: u64,
    // One entry per stored revision, in write order.
    changes: Vec<(u64, String, String)>,
    // doc id → rev → body.
    docs: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    // (doc id, rev) → opaque attachment payload.
    attachments: HashMap<(String, String), Vec<u8>>,
    local: HashMap<String, ReplicationLog>,
    reject_ids: BTreeSet<String>,
    commit_start_time: Option<String>,
}

impl DbState {
    fn insert_doc(&mut self, id: &str, rev: &str, body: serde_json::Value) {
        self.docs
            .entry(id.to_string())
            .or_default()
            .insert(rev.to_string(), body);
        self.update_seq += 1;
        self.changes
            .push((self.update_seq, id.to_string(), rev.to_string()));
    }
}

/// An in-memory CouchDB-alike serving as either end of a replication.
struct MockDb {
    start_time: String,
    state: Mutex<DbState>,
    changed: Notify,
}

impl MockDb {
    fn new(exists: bool) -> Arc<MockDb> {
        Arc::new(MockDb {
            start_time: "1423522201270421".to_string(),
            state: Mutex::new(DbState {
                exists,
                ..DbState::default()
            }),
            changed: Notify::new(),
        })
    }

    fn add_doc(&self, id: &str, rev: &str, body: serde_json::Value) {
        self.state.lock().unwrap().insert_doc(id, rev, body);
        self.changed.notify_waiters();
    }

    fn add_doc_with_attachments(
        &self,
        id: &str,
        rev: &str,
        body: serde_json::Value,
        payload: &[u8],
    ) {
        let mut state = self.state.lock().unwrap();
        state.insert_doc(id, rev, body);
        state
            .attachments
            .insert((id.to_string(), rev.to_string()), payload.to_vec());
        drop(state);
        self.changed.notify_waiters();
    }

    fn reject(&self, id: &str) {
        self.state.lock().unwrap().reject_ids.insert(id.to_string());
    }

    fn pretend_restarted(&self) {
        self.state.lock().unwrap().commit_start_time = Some("99999999".to_string());
    }

    fn doc_count(&self) -> usize {
        self.state.lock().unwrap().docs.len()
    }

    fn has_rev(&self, id: &str, rev: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .docs
            .get(id)
            .map_or(false, |revs| revs.contains_key(rev))
    }

    fn doc(&self, id: &str, rev: &str) -> Option<serde_json::Value> {
        self.state
            .lock()
            .unwrap()
            .docs
            .get(id)
            .and_then(|revs| revs.get(rev).cloned())
    }

    fn attachment_payload(&self, id: &str, rev: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .attachments
            .get(&(id.to_string(), rev.to_string()))
            .cloned()
    }

    fn replication_log(&self, rep_id: &str) -> Option<ReplicationLog> {
        self.state.lock().unwrap().local.get(rep_id).cloned()
    }
}

fn feed_allows(options: &ChangesOptions, id: &str) -> bool {
    match &options.doc_ids {
        Some(doc_ids) => doc_ids.iter().any(|want| want == id),
        None => true,
    }
}

#[async_trait::async_trait]
impl Peer for MockDb {
    async fn exists(&self) -> Result<bool> {
        Ok(self.state.lock().unwrap().exists)
    }

    async fn info(&self) -> Result<DatabaseInfo> {
        let state = self.state.lock().unwrap();
        if !state.exists {
            return Err(Error::Http {
                status: 404,
                message: "no_db_file".to_string(),
            });
        }
        Ok(DatabaseInfo {
            instance_start_time: self.start_time.clone(),
            update_seq: Seq::Number(state.update_seq),
            doc_count: state.docs.len() as u64,
        })
    }

    async fn get_replication_log(&self, rep_id: &str) -> Result<Option<ReplicationLog>> {
        Ok(self.state.lock().unwrap().local.get(rep_id).cloned())
    }

    async fn update_replication_log(
        &self,
        rep_id: &str,
        log: &ReplicationLog,
        rev: Option<&str>,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let current = state.local.get(rep_id).and_then(|log| log.rev.clone());
        if rev.map(str::to_string) != current {
            return Err(Error::Http {
                status: 409,
                message: "conflict".to_string(),
            });
        }
        let next = current
            .as_deref()
            .and_then(|rev| rev.strip_prefix("0-"))
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let new_rev = format!("0-{next}");
        let mut stored = log.clone();
        stored.rev = Some(new_rev.clone());
        state.local.insert(rep_id.to_string(), stored);
        Ok(new_rev)
    }

    async fn ensure_full_commit(&self) -> Result<String> {
        let state = self.state.lock().unwrap();
        Ok(state
            .commit_start_time
            .clone()
            .unwrap_or_else(|| self.start_time.clone()))
    }
}

#[async_trait::async_trait]
impl SourcePeer for MockDb {
    async fn get_filter_function_code(&self, _filter: Option<&str>) -> Result<Option<String>> {
        Ok(None)
    }

    async fn open_doc_revs(
        &self,
        doc_id: &str,
        open_revs: &[String],
        _atts_since: &[String],
        _latest: bool,
        _revs: bool,
    ) -> Result<BoxStream<'static, Result<DocRevision>>> {
        let state = self.state.lock().unwrap();
        let revs = state.docs.get(doc_id).cloned().unwrap_or_default();

        let mut out: Vec<Result<DocRevision>> = Vec::new();
        for rev in open_revs {
            let Some(body) = revs.get(rev) else { continue };
            let attachments = state
                .attachments
                .get(&(doc_id.to_string(), rev.clone()))
                .cloned()
                .map(|payload| -> AttachmentsReader {
                    // Chunk the payload to exercise streaming consumers.
                    let chunks: Vec<std::io::Result<Bytes>> = payload
                        .chunks(3)
                        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                        .collect();
                    futures::stream::iter(chunks).boxed()
                });
            out.push(Ok(DocRevision {
                body: Bytes::from(serde_json::to_vec(body).unwrap()),
                attachments,
            }));
        }
        Ok(futures::stream::iter(out).boxed())
    }

    async fn changes(&self, inbox: WorkQueue<FeedItem>, options: ChangesOptions) -> Result<()> {
        let mut cursor = match &options.since {
            Seq::Number(n) => *n,
            Seq::Text(_) => 0,
        };
        loop {
            let (batch, head) = {
                let state = self.state.lock().unwrap();
                let batch: Vec<(u64, String, String)> = state
                    .changes
                    .iter()
                    .filter(|(seq, id, _)| *seq > cursor && feed_allows(&options, id))
                    .cloned()
                    .collect();
                (batch, state.update_seq)
            };
            for (seq, id, rev) in batch {
                let event = ChangeEvent {
                    id,
                    changes: vec![RevisionRef { rev }],
                    deleted: false,
                };
                inbox
                    .put((Seq::Number(seq), Some(event)))
                    .await
                    .map_err(|_| Error::QueueClosed)?;
            }
            cursor = head;

            if !options.continuous {
                inbox
                    .put((Seq::Number(head), None))
                    .await
                    .map_err(|_| Error::QueueClosed)?;
                return Ok(());
            }

            let mut notified = std::pin::pin!(self.changed.notified());
            notified.as_mut().enable();
            if self.state.lock().unwrap().update_seq > cursor {
                continue;
            }
            notified.await;
        }
    }
}

#[async_trait::async_trait]
impl TargetPeer for MockDb {
    async fn create(&self) -> Result<()> {
        self.state.lock().unwrap().exists = true;
        Ok(())
    }

    async fn revs_diff(
        &self,
        id_revs: IndexMap<String, Vec<String>>,
    ) -> Result<IndexMap<String, DiffEntry>> {
        let state = self.state.lock().unwrap();
        let mut out = IndexMap::new();
        for (id, revs) in id_revs {
            let present = state.docs.get(&id);
            let missing: Vec<String> = revs
                .into_iter()
                .filter(|rev| present.map_or(true, |revs| !revs.contains_key(rev)))
                .collect();
            if missing.is_empty() {
                continue;
            }
            let possible_ancestors = present
                .map(|revs| revs.keys().cloned().collect())
                .unwrap_or_default();
            out.insert(
                id,
                DiffEntry {
                    missing,
                    possible_ancestors,
                },
            );
        }
        Ok(out)
    }

    async fn update_doc(
        &self,
        doc: Bytes,
        mut attachments: AttachmentsReader,
    ) -> Result<Option<WriteFailure>> {
        let body: serde_json::Value = serde_json::from_slice(&doc)?;
        let id = body["_id"].as_str().unwrap_or_default().to_string();
        let rev = body["_rev"].as_str().unwrap_or_default().to_string();

        let mut payload = Vec::new();
        while let Some(chunk) = attachments.next().await {
            payload.extend_from_slice(&chunk.map_err(Error::Attachment)?);
        }

        let mut state = self.state.lock().unwrap();
        if state.reject_ids.contains(&id) {
            return Ok(Some(WriteFailure {
                id,
                error: "forbidden".to_string(),
                reason: "rejected by validation".to_string(),
            }));
        }
        state
            .attachments
            .insert((id.clone(), rev.clone()), payload);
        state.insert_doc(&id, &rev, body);
        Ok(None)
    }

    async fn update_docs(&self, docs: Vec<serde_json::Value>) -> Result<Vec<WriteFailure>> {
        let mut state = self.state.lock().unwrap();
        let mut failures = Vec::new();
        for body in docs {
            let id = body["_id"].as_str().unwrap_or_default().to_string();
            let rev = body["_rev"].as_str().unwrap_or_default().to_string();
            if state.reject_ids.contains(&id) {
                failures.push(WriteFailure {
                    id,
                    error: "forbidden".to_string(),
                    reason: "rejected by validation".to_string(),
                });
                continue;
            }
            state.insert_doc(&id, &rev, body);
        }
        Ok(failures)
    }
}

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn base_task() -> ReplicationTask {
    ReplicationTask::new(
        PeerInfo::from_url("http://localhost:5984/source").unwrap(),
        PeerInfo::from_url("http://localhost:5984/target").unwrap(),
    )
}

fn seed_docs(db: &MockDb, count: usize) {
    for n in 1..=count {
        db.add_doc(
            &format!("d{n}"),
            &format!("1-{n:08x}"),
            json!({"_id": format!("d{n}"), "_rev": format!("1-{n:08x}"), "value": n}),
        );
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn fresh_full_replication() {
    init_logs();
    let source = MockDb::new(true);
    let target = MockDb::new(false);
    seed_docs(&source, 100);

    let mut task = base_task();
    task.create_target = true;

    let replication =
        Replication::new("test-uuid", task, source.clone(), target.clone()).unwrap();
    let state = replication.run().await.unwrap();

    assert_eq!(target.doc_count(), 100);
    assert_eq!(
        state.stats,
        ReplicationStats {
            missing_checked: 100,
            missing_found: 100,
            docs_read: 100,
            docs_written: 100,
            doc_write_failures: 0,
        }
    );
    assert_eq!(state.source_seq, Seq::Number(100));
    assert_eq!(state.committed_seq.id, Seq::Number(100));

    // Both peers carry the checkpoint document.
    for db in [&source, &target] {
        let log = db.replication_log(&state.rep_id).expect("log is recorded");
        assert_eq!(log.source_last_seq, Seq::Number(100));
        assert_eq!(log.session_id, state.session_id);
        assert_eq!(log.replication_id_version, 3);
        assert_eq!(log.history[0].stats.docs_written, 100);
    }
}

#[tokio::test]
async fn missing_target_without_create_fails_startup() {
    init_logs();
    let source = MockDb::new(true);
    let target = MockDb::new(false);
    seed_docs(&source, 1);

    let replication =
        Replication::new("test-uuid", base_task(), source, target).unwrap();
    let err = replication.run().await.unwrap_err();
    assert!(matches!(err, Error::Http { status: 404, .. }));
}

#[tokio::test]
async fn rerunning_a_finished_replication_is_a_no_op() {
    init_logs();
    let source = MockDb::new(true);
    let target = MockDb::new(false);
    seed_docs(&source, 25);

    let mut task = base_task();
    task.create_target = true;

    let first = Replication::new("test-uuid", task.clone(), source.clone(), target.clone())
        .unwrap()
        .run()
        .await
        .unwrap();
    let second = Replication::new("test-uuid", task, source.clone(), target.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(second.rep_id, first.rep_id);
    assert_ne!(second.session_id, first.session_id);
    // No documents moved, no revisions checked.
    assert_eq!(second.stats, ReplicationStats::default());
    assert_eq!(target.doc_count(), 25);

    // The rerun leaves a fresh history entry behind, nothing more.
    let log = target.replication_log(&second.rep_id).unwrap();
    assert_eq!(log.history.len(), 2);
    assert_eq!(log.source_last_seq, Seq::Number(25));
    assert_eq!(log.history[0].session_id, second.session_id);
    assert_eq!(log.history[1].session_id, first.session_id);
}

#[tokio::test]
async fn incremental_replication_resumes_from_checkpoint() {
    init_logs();
    let source = MockDb::new(true);
    let target = MockDb::new(false);
    seed_docs(&source, 10);

    let mut task = base_task();
    task.create_target = true;

    Replication::new("test-uuid", task.clone(), source.clone(), target.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    for n in 11..=15 {
        source.add_doc(
            &format!("d{n}"),
            &format!("1-{n:08x}"),
            json!({"_id": format!("d{n}"), "_rev": format!("1-{n:08x}"), "value": n}),
        );
    }

    let state = Replication::new("test-uuid", task, source.clone(), target.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(target.doc_count(), 15);
    // Only the five new documents were read again.
    assert_eq!(state.stats.docs_read, 5);
    assert_eq!(state.stats.docs_written, 5);
    assert_eq!(state.start_seq.id, Seq::Number(10));
    assert_eq!(state.committed_seq.id, Seq::Number(15));
}

#[tokio::test]
async fn conflicting_revisions_replicate_whole() {
    init_logs();
    let source = MockDb::new(true);
    let target = MockDb::new(false);
    // Conflict set stored via no-new-edits, three concurrent leaves.
    source.add_doc("doc2", "3-ABC", json!({"_id": "doc2", "_rev": "3-ABC"}));
    source.add_doc("doc2", "2-CDE", json!({"_id": "doc2", "_rev": "2-CDE"}));
    source.add_doc("doc2", "2-QWE", json!({"_id": "doc2", "_rev": "2-QWE"}));

    let mut task = base_task();
    task.create_target = true;

    let state = Replication::new("test-uuid", task, source.clone(), target.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    for rev in ["3-ABC", "2-CDE", "2-QWE"] {
        assert!(target.has_rev("doc2", rev), "missing rev {rev}");
    }
    assert_eq!(state.stats.missing_checked, 3);
    assert_eq!(state.stats.missing_found, 3);
    assert_eq!(state.stats.docs_read, 3);
    assert_eq!(state.stats.docs_written, 3);
}

#[tokio::test]
async fn attachments_stream_through_unchanged() {
    init_logs();
    let source = MockDb::new(true);
    let target = MockDb::new(false);

    // Non-ASCII names survive in both directions: the metadata names the
    // attachments, the payload is opaque bytes.
    let body = json!({
        "_id": "doc1",
        "_rev": "1-aaa",
        "_attachments": {
            "тест": {"content_type": "application/octet-stream", "follows": true, "length": 6},
            "passed": {"content_type": "application/octet-stream", "follows": true, "length": 8},
        },
    });
    let payload = [b"passed".as_slice(), "тест".as_bytes()].concat();
    source.add_doc_with_attachments("doc1", "1-aaa", body.clone(), &payload);

    let mut task = base_task();
    task.create_target = true;

    let state = Replication::new("test-uuid", task, source.clone(), target.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(target.doc("doc1", "1-aaa").unwrap(), body);
    assert_eq!(target.attachment_payload("doc1", "1-aaa").unwrap(), payload);
    assert_eq!(state.stats.docs_read, 1);
    assert_eq!(state.stats.docs_written, 1);
    assert_eq!(state.stats.doc_write_failures, 0);
}

#[tokio::test]
async fn doc_ids_filter_replicates_only_named_documents() {
    init_logs();
    let source = MockDb::new(true);
    let target = MockDb::new(false);
    seed_docs(&source, 100);

    let mut task = base_task();
    task.create_target = true;
    task.doc_ids = Some((1..=10).map(|n| format!("d{n}")).collect());

    let state = Replication::new("test-uuid", task, source.clone(), target.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(target.doc_count(), 10);
    for n in 1..=10 {
        assert!(target.has_rev(&format!("d{n}"), &format!("1-{n:08x}")));
    }

    // The reader reported the feed's last seq even though no worker ever
    // processed the filtered-out tail, so the checkpoint covers the whole
    // feed.
    assert_eq!(state.current_through_seq.id, Seq::Number(100));
    let log = target.replication_log(&state.rep_id).unwrap();
    assert_eq!(log.source_last_seq, Seq::Number(100));
}

#[tokio::test]
async fn rejected_writes_are_counted_not_fatal() {
    init_logs();
    let source = MockDb::new(true);
    let target = MockDb::new(false);
    seed_docs(&source, 8);
    target.reject("d3");

    let mut task = base_task();
    task.create_target = true;

    let state = Replication::new("test-uuid", task, source.clone(), target.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(target.doc_count(), 7);
    assert_eq!(state.stats.docs_read, 8);
    assert_eq!(state.stats.docs_written, 7);
    assert_eq!(state.stats.doc_write_failures, 1);
}

#[tokio::test]
async fn target_restart_fails_the_replication() {
    init_logs();
    let source = MockDb::new(true);
    let target = MockDb::new(false);
    seed_docs(&source, 3);
    target.pretend_restarted();

    let mut task = base_task();
    task.create_target = true;

    let err = Replication::new("test-uuid", task, source, target)
        .unwrap()
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PeerRestarted { peer: "target" }));
}

#[tokio::test]
async fn continuous_replication_picks_up_new_writes() {
    init_logs();
    let source = MockDb::new(true);
    let target = MockDb::new(true);

    let mut task = base_task();
    task.continuous = true;
    task.checkpoint_interval = 1;

    let replication =
        Replication::new("test-uuid", task, source.clone(), target.clone()).unwrap();
    let mut states = replication.subscribe();
    let run = tokio::spawn(replication.run());

    // Startup published its first snapshot.
    tokio::time::timeout(Duration::from_secs(10), states.wait_for(|state| state.is_some()))
        .await
        .expect("startup")
        .unwrap();
    let rep_id = states.borrow().as_ref().unwrap().rep_id.clone();

    source.add_doc("doc1", "1-abc", json!({"_id": "doc1", "_rev": "1-abc", "name": "A"}));

    wait_until("doc1 to reach the target", || target.has_rev("doc1", "1-abc")).await;
    wait_until("the checkpoint to cover doc1", || {
        target
            .replication_log(&rep_id)
            .map_or(false, |log| log.source_last_seq == Seq::Number(1))
    })
    .await;

    let stats = states.borrow().as_ref().unwrap().stats;
    assert_eq!(
        stats,
        ReplicationStats {
            missing_checked: 1,
            missing_found: 1,
            docs_read: 1,
            docs_written: 1,
            doc_write_failures: 0,
        }
    );

    run.abort();
}
