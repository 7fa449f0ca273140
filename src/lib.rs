//! Pkgdex: an on-disk inverted search index over package manifests
//!
//! Tokens extracted from package manifests are spooled into size-bounded
//! sorted run files, k-way merged against the existing main dictionary, and
//! published atomically by building the new generation in a scratch
//! directory and moving it into place. Small install/remove deltas bypass
//! the merge entirely through fast-add/fast-remove logs that a query
//! consumer compensates for at read time.
//!
//! The [`engine::IndexEngine`] is the public entrypoint; everything else is
//! the machinery underneath it: the line codec and occurrence tree
//! ([`codec`]), the external sort spooler ([`spool`]), the k-way merge
//! ([`merge`]), the versioned store files ([`store`]), and the directory
//! lock ([`lock`]).

pub mod cli;
pub mod codec;
pub mod engine;
pub mod errors;
pub mod lock;
pub mod manifest;
pub mod merge;
pub mod progress;
pub mod spool;
pub mod store;

pub use codec::OccurrenceTree;
pub use engine::{EngineConfig, IndexEngine, PlanEntry};
pub use errors::IndexError;
pub use manifest::{JsonManifestSource, ManifestSource, MemorySource, SearchEntry};
