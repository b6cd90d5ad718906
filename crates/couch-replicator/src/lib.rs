//! An incremental, resumable, optionally continuous replicator between two
//! CouchDB-compatible databases.
//!
//! The engine streams the source's change feed, asks the target which
//! revisions it is missing, transfers those revisions (attachments included)
//! in no-new-edits mode, and periodically records checkpoints on both peers
//! so interrupted runs can resume. Peers are reached only through the
//! [`peer::SourcePeer`] and [`peer::TargetPeer`] contracts.

pub mod checkpoint;
pub mod peer;
pub mod queue;
pub mod rep_id;
pub mod retry;
pub mod seq;
pub mod state;
pub mod task;
pub mod worker;

mod changes;
mod replication;
pub use replication::{Replication, PROTOCOL_VERSION};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid replication configuration: {0}")]
    Config(String),
    #[error("peer returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("network error talking to a peer: {0}")]
    Network(String),
    #[error("peer request timed out")]
    Timeout,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read an attachment stream")]
    Attachment(#[source] std::io::Error),
    #[error("{peer} instance start time has changed and its prior state cannot be trusted")]
    PeerRestarted { peer: &'static str },
    #[error("{0} unexpectedly stopped")]
    UnexpectedStop(&'static str),
    #[error("work queue is closed")]
    QueueClosed,
    #[error("changes feed ended without a last_seq terminator")]
    TruncatedFeed,
}

impl Error {
    /// Transient errors are worth retrying under the schedule of
    /// [`retry::delays`]. Everything else fails the replication.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout => true,
            Error::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
