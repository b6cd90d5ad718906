//! Canonical external binary term encoding backing the replication id.
//!
//! This is the Erlang external term format restricted to the five shapes
//! the id derivation needs. It must stay bit-stable across implementations
//! and releases: two identically configured replicators hash these exact
//! bytes.

use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Term {
    /// Tagged symbol.
    Atom(&'static str),
    /// Text, encoded as STRING_EXT with a 16-bit length.
    Str(String),
    /// Byte blob, encoded as BINARY_EXT with a 32-bit length.
    Bytes(Vec<u8>),
    Tuple(Vec<Term>),
    List(Vec<Term>),
}

const VERSION: u8 = 131;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;

pub fn encode(term: &Term) -> Result<Vec<u8>> {
    let mut out = vec![VERSION];
    write_term(term, &mut out)?;
    Ok(out)
}

fn write_term(term: &Term, out: &mut Vec<u8>) -> Result<()> {
    match term {
        Term::Atom(name) => {
            out.push(ATOM_EXT);
            let len = u16::try_from(name.len()).map_err(|_| oversize("atom"))?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(name.as_bytes());
        }
        Term::Str(text) => {
            out.push(STRING_EXT);
            let len = u16::try_from(text.len()).map_err(|_| oversize("string"))?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(text.as_bytes());
        }
        Term::Bytes(blob) => {
            out.push(BINARY_EXT);
            let len = u32::try_from(blob.len()).map_err(|_| oversize("binary"))?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(blob);
        }
        Term::Tuple(items) => {
            out.push(SMALL_TUPLE_EXT);
            let arity = u8::try_from(items.len()).map_err(|_| oversize("tuple"))?;
            out.push(arity);
            for item in items {
                write_term(item, out)?;
            }
        }
        Term::List(items) => {
            if items.is_empty() {
                out.push(NIL_EXT);
            } else {
                out.push(LIST_EXT);
                let len = u32::try_from(items.len()).map_err(|_| oversize("list"))?;
                out.extend_from_slice(&len.to_be_bytes());
                for item in items {
                    write_term(item, out)?;
                }
                out.push(NIL_EXT);
            }
        }
    }
    Ok(())
}

fn oversize(kind: &str) -> Error {
    Error::Config(format!("replication id {kind} term is too large to encode"))
}
