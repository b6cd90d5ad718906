//! Capability contracts a replication exercises against its two peers.
//!
//! The engine never speaks HTTP itself: everything it needs from a remote
//! database is expressed through [`SourcePeer`] and [`TargetPeer`].
//! Implementations are expected to retry transient failures internally with
//! [`crate::retry::retry_if_failed`] before surfacing an error, since any
//! error returned through these traits fails the replication.

use crate::queue::WorkQueue;
use crate::seq::Seq;
use crate::state::ReplicationLog;
use crate::Result;
use bytes::Bytes;
use futures::stream::BoxStream;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Database facts sampled at replication startup.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DatabaseInfo {
    /// Marker of when the database instance was opened. A change between two
    /// samples means the peer restarted.
    pub instance_start_time: String,
    pub update_seq: Seq,
    #[serde(default)]
    pub doc_count: u64,
}

/// One event of a source's change feed.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChangeEvent {
    pub id: String,
    pub changes: Vec<RevisionRef>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RevisionRef {
    pub rev: String,
}

/// Parameters of a change-feed request.
#[derive(Clone, Debug, Default)]
pub struct ChangesOptions {
    pub continuous: bool,
    pub doc_ids: Option<Vec<String>>,
    pub filter: Option<String>,
    pub query_params: Option<Vec<(String, String)>>,
    pub since: Seq,
    pub view: Option<String>,
}

/// A change-feed item pushed into the reader's inbox: an event, or the
/// `last_seq` end-of-feed marker carried as `None`.
pub type FeedItem = (Seq, Option<ChangeEvent>);

/// Per-document answer of a target's revs-diff query.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DiffEntry {
    pub missing: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_ancestors: Vec<String>,
}

/// Opaque attachment byte stream accompanying a document revision. The
/// engine forwards it to the target without materializing it in memory.
pub type AttachmentsReader = BoxStream<'static, std::io::Result<Bytes>>;

/// One leaf revision streamed out of [`SourcePeer::open_doc_revs`]: the raw
/// JSON body plus, when the source answered with a multipart stream, the
/// attachment bytes which follow it.
pub struct DocRevision {
    pub body: Bytes,
    pub attachments: Option<AttachmentsReader>,
}

impl fmt::Debug for DocRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocRevision")
            .field("body_len", &self.body.len())
            .field("attachments", &self.attachments.is_some())
            .finish()
    }
}

/// A write the target rejected without failing the replication, or one item
/// of a bulk-update error response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WriteFailure {
    #[serde(default)]
    pub id: String,
    pub error: String,
    #[serde(default)]
    pub reason: String,
}

/// Operations shared by both ends of a replication.
#[async_trait::async_trait]
pub trait Peer: Send + Sync {
    /// Whether the database exists and is reachable.
    async fn exists(&self) -> Result<bool>;

    async fn info(&self) -> Result<DatabaseInfo>;

    /// Fetch the replication log stored at `_local/<rep_id>`, or `None` when
    /// the peer has no record of this replication.
    async fn get_replication_log(&self, rep_id: &str) -> Result<Option<ReplicationLog>>;

    /// Write the replication log at `_local/<rep_id>`, passing the prior
    /// revision when one is known. Returns the new revision.
    async fn update_replication_log(
        &self,
        rep_id: &str,
        log: &ReplicationLog,
        rev: Option<&str>,
    ) -> Result<String>;

    /// Ask the peer to flush all changes to durable storage. Returns the
    /// peer's `instance_start_time`.
    async fn ensure_full_commit(&self) -> Result<String>;
}

#[async_trait::async_trait]
pub trait SourcePeer: Peer {
    /// Source text of a filter function stored in a design document, or
    /// `None` for a builtin (`_`-prefixed) or absent filter.
    async fn get_filter_function_code(&self, filter: Option<&str>) -> Result<Option<String>>;

    /// Stream the requested leaf revisions of a document, one
    /// [`DocRevision`] per revision, with attachments the target does not
    /// already have (`atts_since`) carried inline.
    async fn open_doc_revs(
        &self,
        doc_id: &str,
        open_revs: &[String],
        atts_since: &[String],
        latest: bool,
        revs: bool,
    ) -> Result<BoxStream<'static, Result<DocRevision>>>;

    /// Drive the change feed to completion, pushing `(seq, Some(event))`
    /// per change into `inbox` and `(last_seq, None)` at end-of-feed. A
    /// continuous feed returns only on error or cancellation.
    async fn changes(&self, inbox: WorkQueue<FeedItem>, options: ChangesOptions) -> Result<()>;
}

#[async_trait::async_trait]
pub trait TargetPeer: Peer {
    /// Create the target database.
    async fn create(&self) -> Result<()>;

    /// Reduce the proposed `doc id → revisions` mapping to the revisions
    /// the target is missing.
    async fn revs_diff(
        &self,
        id_revs: IndexMap<String, Vec<String>>,
    ) -> Result<IndexMap<String, DiffEntry>>;

    /// Store one document with its attachment stream in no-new-edits mode.
    /// Returns `Some` for a non-fatal rejection (HTTP 401/403), which the
    /// caller counts as a write failure and moves past.
    async fn update_doc(
        &self,
        doc: Bytes,
        attachments: AttachmentsReader,
    ) -> Result<Option<WriteFailure>>;

    /// Bulk-store documents in no-new-edits mode, returning only the items
    /// which failed.
    async fn update_docs(&self, docs: Vec<serde_json::Value>) -> Result<Vec<WriteFailure>>;
}
