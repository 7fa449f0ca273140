//! Error taxonomy for index construction and maintenance
//!
//! Everything a caller may want to react to programmatically is a distinct
//! variant: lock contention, bad permissions, and a partially-present store
//! set all have different recovery stories. Ordering violations during a
//! merge are deliberately *not* represented here; an out-of-order token can
//! only mean a spooler or merge bug, so those panic instead.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while building or updating a search index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The configured sort-run byte budget was zero. Raised at construction
    /// time, before any file is touched.
    #[error("sort file size limit must be greater than zero")]
    InvalidRunBudget,

    /// The filesystem refused an operation the indexer must be able to
    /// perform (create, move, or remove files under the index root).
    #[error("incorrect permissions on {path}; correct this and rebuild the index")]
    Permissions { path: PathBuf },

    /// Another process holds the index lock. Carries whatever holder
    /// information could be read back out of the lock file.
    #[error("the search index is in use by another process{}", fmt_holder(.pid, .holder))]
    Locked {
        pid: Option<u32>,
        holder: Option<String>,
    },

    /// Some, but not all, store files are present (or their versions
    /// disagree). Never repaired automatically: a partial set may be a
    /// competing writer mid-publish or real corruption, and guessing which
    /// would make things worse.
    #[error("inconsistent index in {dir}; remove the directory and rebuild from scratch")]
    InconsistentIndex { dir: PathBuf },

    /// A store line or token could not be decoded.
    #[error("malformed index data ({reason}): {line:?}")]
    Parse { line: String, reason: String },

    /// No index exists where one was required.
    #[error("no index found in {dir}")]
    NoIndex { dir: PathBuf },

    /// The installed-set hash recorded in the index does not match the
    /// candidate set.
    #[error("index hash mismatch: stored {existing}, computed {incoming}")]
    HashMismatch { existing: String, incoming: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IndexError {
    pub(crate) fn parse(line: impl Into<String>, reason: impl Into<String>) -> Self {
        IndexError::Parse {
            line: line.into(),
            reason: reason.into(),
        }
    }
}

fn fmt_holder(pid: &Option<u32>, holder: &Option<String>) -> String {
    match (pid, holder) {
        (Some(pid), Some(holder)) => format!(": pid {} ({})", pid, holder),
        (Some(pid), None) => format!(": pid {}", pid),
        _ => String::new(),
    }
}

/// True when an I/O error means the filesystem is refusing us outright
/// (permission denied or read-only), as opposed to a transient condition.
pub(crate) fn is_permission_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
    )
}
