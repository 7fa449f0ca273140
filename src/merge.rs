//! K-way merge over sorted run files
//!
//! Consumes the spooler's runs and yields one `(token, occurrence tree)`
//! pair per distinct token, in strictly increasing token order. A token
//! present in several runs has its trees spliced together before emission.
//! The stream is lazy and single-pass: one open handle and one decoded
//! "current line" per still-live run.
//!
//! The existing main dictionary is *not* one of the inputs here; the update
//! engine interleaves it separately so removal filtering can happen while
//! streaming the old file.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::codec::{self, splice, OccurrenceTree};
use crate::errors::IndexError;

struct RunCursor {
    path: PathBuf,
    reader: BufReader<File>,
    current: Option<(String, OccurrenceTree)>,
}

impl RunCursor {
    fn open(path: &Path) -> Result<Self, IndexError> {
        let reader = BufReader::new(File::open(path)?);
        let mut cursor = Self {
            path: path.to_path_buf(),
            reader,
            current: None,
        };
        cursor.advance()?;
        Ok(cursor)
    }

    /// Decode the next line, or mark the run exhausted at EOF.
    fn advance(&mut self) -> Result<(), IndexError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            log::debug!("run {:?} exhausted", self.path);
            self.current = None;
        } else {
            self.current = Some(codec::decode_line(&line)?);
        }
        Ok(())
    }
}

/// Merged, de-duplicated stream over a set of sorted run files.
pub struct RunMerger {
    cursors: Vec<RunCursor>,
    last_emitted: Option<String>,
}

impl RunMerger {
    /// Open every run and prime its first record. Empty runs are dropped
    /// immediately (a rotation can legitimately leave a zero-length run).
    pub fn open(runs: &[PathBuf]) -> Result<Self, IndexError> {
        let mut cursors = Vec::with_capacity(runs.len());
        for path in runs {
            let cursor = RunCursor::open(path)?;
            if cursor.current.is_some() {
                cursors.push(cursor);
            }
        }
        Ok(Self {
            cursors,
            last_emitted: None,
        })
    }
}

impl Iterator for RunMerger {
    type Item = Result<(String, OccurrenceTree), IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self
            .cursors
            .iter()
            .filter_map(|c| c.current.as_ref().map(|(t, _)| t))
            .min()
            .cloned()?;

        let mut merged = OccurrenceTree::new();
        for cursor in &mut self.cursors {
            // A run holds one line per spooled occurrence, so the same token
            // can repeat on consecutive lines; drain them all before moving
            // on.
            while matches!(&cursor.current, Some((t, _)) if *t == token) {
                let (_, tree) = cursor.current.take().expect("checked above");
                splice(&mut merged, tree);
                if let Err(e) = cursor.advance() {
                    return Some(Err(e));
                }
            }
        }
        self.cursors.retain(|c| c.current.is_some());

        if let Some(last) = &self.last_emitted {
            if *last >= token {
                panic!(
                    "merge produced token {:?} after {:?}; a sort run was not sorted",
                    token, last
                );
            }
        }
        self.last_emitted = Some(token.clone());
        Some(Ok((token, merged)))
    }
}
