//! Merkle-DAG primitives: content identifiers and commit blocks.

mod block;
mod cid;

pub use block::{BlockLink, CommitBlock, DagError, HEAD_LINK};
pub use cid::Cid;
