//! External sort spooler
//!
//! Token occurrences arrive in manifest order, which is effectively random
//! with respect to token order. Rather than holding the whole token set in
//! memory, the spooler serializes each occurrence through the line codec and
//! spills to size-bounded run files (`sort.0`, `sort.1`, ...) in the scratch
//! directory. Each run is sorted in memory just before it is sealed, so by
//! `close()` every run on disk is individually token-ordered and ready for
//! the k-way merge.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::codec::{self, OccurrenceTree};
use crate::errors::IndexError;

/// Run files are named with this prefix plus a monotonically increasing
/// sequence number.
pub const SORT_FILE_PREFIX: &str = "sort.";

/// Accumulates encoded token lines into sorted, size-bounded run files.
pub struct SortSpooler {
    tmp_dir: PathBuf,
    max_run_bytes: u64,
    writer: Option<BufWriter<File>>,
    run_num: u32,
    run_bytes: u64,
    run_paths: Vec<PathBuf>,
    lines_spooled: u64,
}

impl SortSpooler {
    /// Create a spooler writing runs under `tmp_dir`. The byte budget is a
    /// soft limit: a run holding a single line may exceed it, but no run
    /// ever exceeds it by more than one line. A zero budget fails fast.
    pub fn new(tmp_dir: &Path, max_run_bytes: u64) -> Result<Self, IndexError> {
        if max_run_bytes == 0 {
            return Err(IndexError::InvalidRunBudget);
        }
        Ok(Self {
            tmp_dir: tmp_dir.to_path_buf(),
            max_run_bytes,
            writer: None,
            run_num: 0,
            run_bytes: 0,
            run_paths: Vec::new(),
            lines_spooled: 0,
        })
    }

    /// Record one token occurrence. Rotates to a fresh run first if
    /// appending this line would push the current run to or past the budget.
    pub fn add(&mut self, token: &str, tree: &OccurrenceTree) -> Result<(), IndexError> {
        let line = codec::encode_line(token, tree)?;
        if self.writer.is_some()
            && self.run_bytes > 0
            && self.run_bytes + line.len() as u64 >= self.max_run_bytes
        {
            self.seal_current_run()?;
        }
        if self.writer.is_none() {
            self.open_next_run()?;
        }
        // unwrap is fine: open_next_run just set it
        let writer = self.writer.as_mut().unwrap();
        writer.write_all(line.as_bytes())?;
        self.run_bytes += line.len() as u64;
        self.lines_spooled += 1;
        Ok(())
    }

    /// Seal the final run and hand back every run path, each one sorted.
    pub fn close(mut self) -> Result<Vec<PathBuf>, IndexError> {
        if self.writer.is_some() {
            self.seal_current_run()?;
        }
        log::debug!(
            "spooled {} lines into {} sorted runs",
            self.lines_spooled,
            self.run_paths.len()
        );
        Ok(self.run_paths)
    }

    fn open_next_run(&mut self) -> Result<(), IndexError> {
        let path = self
            .tmp_dir
            .join(format!("{}{}", SORT_FILE_PREFIX, self.run_num));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        self.writer = Some(BufWriter::new(file));
        self.run_paths.push(path);
        self.run_num += 1;
        self.run_bytes = 0;
        Ok(())
    }

    /// Flush and close the active run, then rewrite it with its lines in
    /// token order.
    fn seal_current_run(&mut self) -> Result<(), IndexError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        self.run_bytes = 0;
        let path = match self.run_paths.last() {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        sort_run_file(&path)
    }
}

/// Sort one run file in place by decoded token, using a stable sort so
/// equal-token lines keep their spool order.
fn sort_run_file(path: &Path) -> Result<(), IndexError> {
    let content = fs::read_to_string(path)?;
    let mut keyed: Vec<(String, &str)> = Vec::new();
    for line in content.lines() {
        keyed.push((codec::decode_token(line)?, line));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));

    let file = OpenOptions::new().write(true).truncate(true).open(path)?;
    let mut writer = BufWriter::new(file);
    for (_, line) in &keyed {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::leaf;
    use tempfile::TempDir;

    fn spool_tokens(tmp: &Path, budget: u64, tokens: &[&str]) -> Vec<PathBuf> {
        let mut spooler = SortSpooler::new(tmp, budget).unwrap();
        for (i, tok) in tokens.iter().enumerate() {
            let tree = leaf("file", "basename", tok, i as u64, &[0]);
            spooler.add(tok, &tree).unwrap();
        }
        spooler.close().unwrap()
    }

    #[test]
    fn test_zero_budget_fails_fast() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            SortSpooler::new(temp.path(), 0),
            Err(IndexError::InvalidRunBudget)
        ));
    }

    #[test]
    fn test_runs_are_individually_sorted() {
        let temp = TempDir::new().unwrap();
        let runs = spool_tokens(temp.path(), 64, &["zebra", "apple", "mango", "kiwi", "fig"]);
        assert!(runs.len() > 1, "budget should have forced multiple runs");
        for run in &runs {
            let content = fs::read_to_string(run).unwrap();
            let tokens: Vec<String> = content
                .lines()
                .map(|l| codec::decode_token(l).unwrap())
                .collect();
            let mut sorted = tokens.clone();
            sorted.sort();
            assert_eq!(tokens, sorted, "run {:?} is not sorted", run);
        }
    }

    #[test]
    fn test_run_size_soft_limit() {
        let temp = TempDir::new().unwrap();
        let runs = spool_tokens(temp.path(), 1, &["a", "b", "c"]);
        // A one-byte budget means at most one line per run.
        for run in &runs {
            let content = fs::read_to_string(run).unwrap();
            assert!(content.lines().count() <= 1);
        }
        assert_eq!(runs.len(), 3);
    }

    #[test]
    fn test_single_run_when_budget_is_large() {
        let temp = TempDir::new().unwrap();
        let runs = spool_tokens(temp.path(), 1 << 20, &["b", "a", "c"]);
        assert_eq!(runs.len(), 1);
        let content = fs::read_to_string(&runs[0]).unwrap();
        let tokens: Vec<String> = content
            .lines()
            .map(|l| codec::decode_token(l).unwrap())
            .collect();
        assert_eq!(tokens, ["a", "b", "c"]);
    }

    #[test]
    fn test_run_files_named_by_sequence() {
        let temp = TempDir::new().unwrap();
        let runs = spool_tokens(temp.path(), 1, &["x", "y"]);
        assert!(runs[0].ends_with("sort.0"));
        assert!(runs[1].ends_with("sort.1"));
    }
}
