//! Deterministic replication id, protocol version 3.
//!
//! The id names the checkpoint documents on both peers, so equal task
//! configurations must derive the identical id no matter which replicator
//! instance computes it.

pub mod term;

use crate::task::{PeerInfo, ReplicationTask};
use crate::Result;
use term::Term;

/// Derive the version-3 replication id for a task.
///
/// `filter_code` is the fetched source text of a stored `ddoc/name` filter.
/// Builtin filters pass `None` and discriminate through `doc_ids` instead,
/// matching how the id survives across runs of the same task.
pub fn v3(rep_uuid: &str, task: &ReplicationTask, filter_code: Option<&str>) -> Result<String> {
    let mut parts = vec![
        Term::Bytes(rep_uuid.as_bytes().to_vec()),
        endpoint(&task.source),
        endpoint(&task.target),
    ];

    match filter_code {
        None => {
            if let Some(doc_ids) = task.doc_ids.as_ref().filter(|ids| !ids.is_empty()) {
                parts.push(Term::List(
                    doc_ids
                        .iter()
                        .map(|id| Term::Bytes(id.as_bytes().to_vec()))
                        .collect(),
                ));
            }
        }
        Some(code) => {
            parts.push(Term::Bytes(code.trim().as_bytes().to_vec()));
            let pairs = task
                .query_params
                .as_ref()
                .map(|params| params.pairs())
                .unwrap_or_default();
            parts.push(Term::Tuple(vec![Term::List(
                pairs
                    .into_iter()
                    .map(|(key, value)| {
                        Term::Tuple(vec![
                            Term::Bytes(key.into_bytes()),
                            Term::Bytes(value.into_bytes()),
                        ])
                    })
                    .collect(),
            )]));
        }
    }

    let encoded = term::encode(&Term::List(parts))?;
    let mut rep_id = format!("{:x}", md5::compute(&encoded));
    if task.continuous {
        rep_id.push_str("+continuous");
    }
    if task.create_target {
        rep_id.push_str("+create_target");
    }
    Ok(rep_id)
}

fn endpoint(peer: &PeerInfo) -> Term {
    let mut url = peer.url.to_string();
    if !url.ends_with('/') {
        url.push('/');
    }

    // Header names hash upper-cased and sorted, the stored form of a
    // case-insensitive header map.
    let mut headers: Vec<(String, String)> = peer
        .headers
        .iter()
        .map(|(name, value)| (name.to_uppercase(), value.clone()))
        .collect();
    headers.sort();

    Term::Tuple(vec![
        Term::Atom("remote"),
        Term::Str(url),
        Term::List(
            headers
                .into_iter()
                .map(|(name, value)| Term::Tuple(vec![Term::Str(name), Term::Str(value)]))
                .collect(),
        ),
    ])
}
