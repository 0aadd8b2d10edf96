//! SQLite-backed datastore. The unique index on `runs.external_ref` is what makes
//! a claim exclusive across processes.

mod storage;

pub use storage::*;
