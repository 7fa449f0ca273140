//! Index update engine
//!
//! Owns one index directory and drives every mutation of it: full rebuilds,
//! incremental updates with the fast/full split, and the
//! build-in-scratch-then-move publication step. All writes happen under the
//! directory lock; the only operation that runs outside it is the
//! rebuild-from-scratch directory swap, because the lock file lives inside
//! the directory being destroyed.
//!
//! A full update streams the existing main dictionary and interleaves it
//! with the k-way merge of freshly spooled runs, filtering out occurrences
//! of removed (or re-indexed) packages on the way through. The dictionary,
//! the token byte-offset store, the inverted package-offset store, and the
//! per-action-type / per-subtype postings files are all written in that
//! single pass.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{self, OccurrenceTree};
use crate::errors::{is_permission_error, IndexError};
use crate::lock::LockFile;
use crate::manifest::ManifestSource;
use crate::merge::RunMerger;
use crate::progress::{NullProgress, ProgressTracker};
use crate::spool::SortSpooler;
use crate::store::{
    self, consistent_open, write_version_line, HashStore, IdMapStore, InvertedStore, OffsetStore,
    SetStore,
};

/// Version written by the first successful rebuild.
pub const INITIAL_VERSION: u32 = 1;

/// Scratch directory name inside the index root.
pub const TMP_DIR_NAME: &str = "TMP";

/// Per-action-type and per-subtype postings file prefixes.
pub const AT_FILE_PREFIX: &str = "__at_";
pub const ST_FILE_PREFIX: &str = "__st_";

/// Superseded layout removed after a full publish.
const LEGACY_DIR_NAME: &str = "pkg";

pub const DEFAULT_SORT_FILE_MAX_SIZE: u64 = 128 * 1024 * 1024;
pub const DEFAULT_MAX_FAST_INDEXED_PKGS: usize = 100;
pub const FILE_OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Soft byte budget per sort run. Must be non-zero.
    pub sort_file_max_size: u64,
    /// Largest fast-add backlog the fast update path will accept. A plan
    /// leaving the backlog strictly above this falls back to a full merge.
    pub max_fast_indexed_pkgs: usize,
    /// How long a consistency probe tolerates a mixed store set before
    /// declaring the index inconsistent.
    pub file_open_timeout: Duration,
    /// Written into the lock file so contenders can name the holder.
    pub client_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sort_file_max_size: DEFAULT_SORT_FILE_MAX_SIZE,
            max_fast_indexed_pkgs: DEFAULT_MAX_FAST_INDEXED_PKGS,
            file_open_timeout: FILE_OPEN_TIMEOUT,
            client_name: "pkgdex".to_string(),
        }
    }
}

/// One step of an update plan: a package arriving, departing, or (on
/// upgrade) both at once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanEntry {
    pub added: Option<String>,
    pub removed: Option<String>,
}

impl PlanEntry {
    pub fn add(fmri: &str) -> Self {
        Self {
            added: Some(fmri.to_string()),
            removed: None,
        }
    }

    pub fn remove(fmri: &str) -> Self {
        Self {
            added: None,
            removed: Some(fmri.to_string()),
        }
    }

    pub fn replace(old: &str, new: &str) -> Self {
        Self {
            added: Some(new.to_string()),
            removed: Some(old.to_string()),
        }
    }
}

/// Engine over one index directory, fed by one manifest source.
pub struct IndexEngine<M: ManifestSource> {
    index_dir: PathBuf,
    source: M,
    config: EngineConfig,
    lock: LockFile,
    progress: Box<dyn ProgressTracker>,

    fast_add: SetStore,
    fast_remove: SetStore,
    id_map: IdMapStore,
    full_fmri: SetStore,
    hash: HashStore,
    token_offsets: OffsetStore,
    inverted: InvertedStore,

    /// Generation of the store set last read from disk, if one exists.
    version: Option<u32>,
}

impl<M: ManifestSource> IndexEngine<M> {
    pub fn new(index_dir: &Path, source: M, config: EngineConfig) -> Self {
        let lock = LockFile::new(index_dir, &config.client_name);
        Self {
            index_dir: index_dir.to_path_buf(),
            source,
            config,
            lock,
            progress: Box::new(NullProgress),
            fast_add: SetStore::new(store::FAST_ADD_FILE),
            fast_remove: SetStore::new(store::FAST_REMOVE_FILE),
            id_map: IdMapStore::new(store::MANIFEST_LIST_FILE),
            full_fmri: SetStore::new(store::FULL_FMRI_FILE),
            hash: HashStore::new(store::FULL_FMRI_HASH_FILE),
            token_offsets: OffsetStore::new(store::BYTE_OFFSET_FILE),
            inverted: InvertedStore::new(store::FMRI_OFFSETS_FILE),
            version: None,
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressTracker>) -> Self {
        self.progress = progress;
        self
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn lock(&mut self, blocking: bool) -> Result<(), IndexError> {
        self.lock.lock(blocking)
    }

    pub fn unlock(&mut self) {
        self.lock.unlock();
    }

    /// Whether a complete index exists here. `Ok(false)` means no store file
    /// is present at all; a partial or version-mismatched set is the
    /// inconsistency error, never a boolean.
    pub fn check_index_existence(&self) -> Result<bool, IndexError> {
        if !self.index_dir.exists() {
            return Ok(false);
        }
        Ok(consistent_open(
            &self.index_dir,
            &store::store_file_names(),
            self.config.file_open_timeout,
        )?
        .is_some())
    }

    /// Create the index directory and, if no index exists yet, seed an empty
    /// store set at the initial version so readers see a consistent (if
    /// vacuous) index.
    pub fn setup(&mut self) -> Result<(), IndexError> {
        self.create_dir(&self.index_dir.clone())?;
        if self.check_index_existence()? {
            return Ok(());
        }
        self.lock(false)?;
        let result = self.write_empty_stores(INITIAL_VERSION);
        self.unlock();
        result?;
        self.version = Some(INITIAL_VERSION);
        Ok(())
    }

    /// Does the index cover exactly this package set? Answered from the
    /// recorded hash without reading the existence set.
    pub fn check_index_has_exactly_fmris<I, S>(&mut self, fmris: I) -> Result<(), IndexError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.read_input_indexes()? {
            return Err(IndexError::NoIndex {
                dir: self.index_dir.clone(),
            });
        }
        self.hash.check_against(fmris)
    }

    /// Full update over an authoritative package list. Any pending fast-add
    /// and fast-remove logs are absorbed into the merge and cleared.
    pub fn server_update_index(
        &mut self,
        fmris: &[String],
        scratch_override: Option<&Path>,
    ) -> Result<(), IndexError> {
        self.lock(false)?;
        let result = self.full_update_locked(fmris, scratch_override);
        self.unlock();
        result
    }

    /// Apply an install/remove plan. Small deltas take the fast path, which
    /// only rewrites the log stores; past the backlog threshold the lock is
    /// dropped and the index is rebuilt from scratch over `installed`
    /// (rebuild takes its own lock).
    pub fn client_update_index(
        &mut self,
        plan: &[PlanEntry],
        installed: &[String],
        scratch_override: Option<&Path>,
    ) -> Result<(), IndexError> {
        self.lock(false)?;
        let fast = match self.try_fast_update(plan, scratch_override) {
            Ok(fast) => fast,
            Err(e) => {
                self.unlock();
                return Err(e);
            }
        };
        self.unlock();
        if fast {
            return Ok(());
        }
        log::info!("fast update not applicable; rebuilding the index");
        self.rebuild_index_from_scratch(installed, scratch_override)
    }

    /// Destroy the index directory and rebuild it over `installed`. The
    /// directory swap happens outside any lock: the lock file lives inside
    /// the directory being replaced.
    pub fn rebuild_index_from_scratch(
        &mut self,
        installed: &[String],
        scratch_override: Option<&Path>,
    ) -> Result<(), IndexError> {
        self.unlock();
        if self.index_dir.exists() {
            let mut aside = self.index_dir.clone().into_os_string();
            aside.push(".old");
            let aside = PathBuf::from(aside);
            if aside.exists() {
                fs::remove_dir_all(&aside)?;
            }
            fs::rename(&self.index_dir, &aside).map_err(|e| self.map_fs(&self.index_dir, e))?;
            if let Err(e) = fs::remove_dir_all(&aside) {
                log::warn!("could not remove old index at {:?}: {}", aside, e);
            }
        }
        self.create_dir(&self.index_dir.clone())?;
        self.reset_state();
        self.server_update_index(installed, scratch_override)
    }

    // Lock must be held. Reads the small stores from disk when a consistent
    // set exists; resets to the empty state when none does.
    fn read_input_indexes(&mut self) -> Result<bool, IndexError> {
        let version = consistent_open(
            &self.index_dir,
            &store::store_file_names(),
            self.config.file_open_timeout,
        )?;
        match version {
            Some(v) => {
                self.fast_add.read(&self.index_dir)?;
                self.fast_remove.read(&self.index_dir)?;
                self.id_map.read(&self.index_dir)?;
                self.full_fmri.read(&self.index_dir)?;
                self.hash.read(&self.index_dir)?;
                self.version = Some(v);
                Ok(true)
            }
            None => {
                self.reset_state();
                Ok(false)
            }
        }
    }

    fn reset_state(&mut self) {
        self.fast_add.clear();
        self.fast_remove.clear();
        self.id_map.clear();
        self.full_fmri.clear();
        self.hash.clear();
        self.inverted.clear();
        self.version = None;
    }

    /// Fast path: fold the plan into the fast-add/fast-remove logs without
    /// touching the main dictionary. Returns false (and changes nothing on
    /// disk) when there is no index yet or the resulting backlog is too
    /// large for query-time compensation to stay cheap.
    fn try_fast_update(
        &mut self,
        plan: &[PlanEntry],
        scratch_override: Option<&Path>,
    ) -> Result<bool, IndexError> {
        if !self.read_input_indexes()? {
            return Ok(false);
        }
        for entry in plan {
            if let Some(removed) = &entry.removed {
                // Removing a package whose addition was never merged just
                // cancels the pending addition.
                if !self.fast_add.remove(removed) {
                    self.fast_remove.add(removed.clone());
                }
                self.full_fmri.remove(removed);
            }
            if let Some(added) = &entry.added {
                // The mirror image: installing over a pending removal
                // cancels the removal.
                if !self.fast_remove.remove(added) {
                    self.fast_add.add(added.clone());
                }
                self.id_map.get_id_and_add(added);
                self.full_fmri.add(added.clone());
            }
        }
        if self.fast_add.len() > self.config.max_fast_indexed_pkgs {
            return Ok(false);
        }

        let version = self.version.expect("index existed");
        self.hash.set_from(self.full_fmri.as_set());
        let scratch = self.prepare_scratch(scratch_override)?;
        self.fast_add.write(&scratch, version)?;
        self.fast_remove.write(&scratch, version)?;
        self.id_map.write(&scratch, version)?;
        self.full_fmri.write(&scratch, version)?;
        self.hash.write(&scratch, version)?;
        self.migrate(&scratch, true)?;
        Ok(true)
    }

    // Lock must be held.
    fn full_update_locked(
        &mut self,
        fmris: &[String],
        scratch_override: Option<&Path>,
    ) -> Result<(), IndexError> {
        let existed = self.read_input_indexes()?;

        // Absorb the pending fast logs: packages awaiting a cheap merge get
        // indexed now, pending removals get filtered now.
        let mut adds: BTreeSet<String> = fmris.iter().cloned().collect();
        adds.extend(self.fast_add.iter().cloned());
        let mut removed: BTreeSet<String> = self.fast_remove.iter().cloned().collect();
        // Re-indexed packages shed their old dictionary entries too.
        removed.extend(adds.iter().cloned());
        self.fast_add.clear();
        self.fast_remove.clear();

        let scratch = self.prepare_scratch(scratch_override)?;
        let runs = self.spool_packages(&adds, &scratch)?;
        let merger = RunMerger::open(&runs)?;

        let new_version = match self.version {
            Some(v) => v + 1,
            None => INITIAL_VERSION,
        };
        self.progress.job_start("merging index", None);
        let seen_ids = self.write_new_index(&scratch, merger, &removed, existed, new_version)?;
        self.progress.job_done();

        self.write_assistant_dicts(&scratch, &adds, &removed, &seen_ids, new_version)?;
        self.migrate(&scratch, false)?;
        self.version = Some(new_version);
        Ok(())
    }

    /// Feed every package's search entries through the spooler. A package
    /// whose manifest cannot be fetched is logged and skipped; the rebuild
    /// carries on without it.
    fn spool_packages(
        &mut self,
        adds: &BTreeSet<String>,
        scratch: &Path,
    ) -> Result<Vec<PathBuf>, IndexError> {
        self.progress
            .job_start("indexing packages", Some(adds.len() as u64));
        let mut spooler = SortSpooler::new(scratch, self.config.sort_file_max_size)?;
        for fmri in adds {
            let pkg_id = self.id_map.get_id_and_add(fmri);
            match self.source.search_entries(fmri) {
                Ok(entries) => {
                    for entry in &entries {
                        let tree = codec::leaf(
                            &entry.action,
                            &entry.subtype,
                            &entry.value,
                            pkg_id,
                            &entry.offsets,
                        );
                        spooler.add(&entry.token, &tree)?;
                    }
                }
                Err(e) => {
                    log::warn!("skipping {}: could not read manifest: {}", fmri, e);
                }
            }
            self.progress.job_add_progress(1);
        }
        self.progress.job_done();
        spooler.close()
    }

    /// Single pass producing the new main dictionary and everything derived
    /// from it: the token byte-offset store, the inverted package-offset
    /// store, and the per-action-type / per-subtype postings files. The
    /// merged run stream is interleaved with the old dictionary; occurrences
    /// of packages in `removed` are dropped as the old file streams through.
    /// Returns every package id that survived into the new dictionary.
    fn write_new_index(
        &mut self,
        scratch: &Path,
        merger: RunMerger,
        removed: &BTreeSet<String>,
        old_exists: bool,
        version: u32,
    ) -> Result<BTreeSet<u64>, IndexError> {
        let dict_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(scratch.join(store::MAIN_DICT_FILE))?;
        let mut dict = BufWriter::new(dict_file);
        write_version_line(&mut dict, version)?;
        let mut offset = (store::VERSION_PREFIX.len() + version.to_string().len() + 1) as u64;

        self.token_offsets.open_out(scratch, version)?;
        self.inverted.clear();
        let mut at_files: HashMap<String, BufWriter<File>> = HashMap::new();
        let mut st_files: HashMap<String, BufWriter<File>> = HashMap::new();
        let mut seen_ids: BTreeSet<u64> = BTreeSet::new();
        let mut last_token: Option<String> = None;

        let mut old = if old_exists {
            let mut reader = BufReader::new(File::open(self.index_dir.join(store::MAIN_DICT_FILE))?);
            store::read_version_line(&mut reader)?;
            Some(OldDictCursor::new(reader))
        } else {
            None
        };
        let mut old_current = match old.as_mut() {
            Some(cursor) => cursor.next_record()?,
            None => None,
        };
        let mut merger = merger;
        let mut new_current = merger.next().transpose()?;

        loop {
            #[derive(Clone, Copy)]
            enum Take {
                New,
                Old,
                Both,
            }
            let take = match (&new_current, &old_current) {
                (None, None) => break,
                (Some(_), None) => Take::New,
                (None, Some(_)) => Take::Old,
                (Some((nt, _)), Some((ot, _))) => {
                    if nt < ot {
                        Take::New
                    } else if nt == ot {
                        Take::Both
                    } else {
                        Take::Old
                    }
                }
            };

            let record = match take {
                Take::New => new_current.take(),
                Take::Old => {
                    let (token, tree) = old_current.take().expect("matched Some");
                    let tree = self.filter_removed(tree, removed);
                    Some((token, tree))
                }
                Take::Both => {
                    let (token, new_tree) = new_current.take().expect("matched Some");
                    let (_, old_tree) = old_current.take().expect("matched Some");
                    let mut tree = self.filter_removed(old_tree, removed);
                    codec::splice(&mut tree, new_tree);
                    Some((token, tree))
                }
            };

            match take {
                Take::New => new_current = merger.next().transpose()?,
                Take::Old => old_current = old.as_mut().expect("old side live").next_record()?,
                Take::Both => {
                    new_current = merger.next().transpose()?;
                    old_current = old.as_mut().expect("old side live").next_record()?;
                }
            }

            let (token, tree) = record.expect("selected a side");
            if tree.is_empty() {
                continue;
            }
            if let Some(last) = &last_token {
                if *last >= token {
                    panic!(
                        "dictionary write produced token {:?} after {:?}; merge order broken",
                        token, last
                    );
                }
            }

            let line = codec::encode_line(&token, &tree)?;
            self.token_offsets.write_entity(&token, offset)?;
            for (action_type, subtypes) in &tree {
                postings_line(&mut at_files, scratch, AT_FILE_PREFIX, action_type, offset)?;
                for (subtype, values) in subtypes {
                    postings_line(&mut st_files, scratch, ST_FILE_PREFIX, subtype, offset)?;
                    for packages in values.values() {
                        for &pkg_id in packages.keys() {
                            self.inverted.add_pair(pkg_id, offset);
                            seen_ids.insert(pkg_id);
                        }
                    }
                }
            }
            dict.write_all(line.as_bytes())?;
            offset += line.len() as u64;
            last_token = Some(token);
        }

        dict.flush()?;
        self.token_offsets.close_out()?;
        for writer in at_files.values_mut().chain(st_files.values_mut()) {
            writer.flush()?;
        }
        self.inverted.write(scratch, version, &self.id_map)?;
        Ok(seen_ids)
    }

    /// Drop occurrences belonging to removed packages. A package id with no
    /// interned FMRI is kept and logged; dropping data on a bookkeeping gap
    /// would lose index content silently.
    fn filter_removed(&self, tree: OccurrenceTree, removed: &BTreeSet<String>) -> OccurrenceTree {
        if removed.is_empty() {
            return tree;
        }
        let mut out = OccurrenceTree::new();
        for (action_type, subtypes) in tree {
            for (subtype, values) in subtypes {
                for (value, packages) in values {
                    for (pkg_id, offsets) in packages {
                        let keep = match self.id_map.get_entity(pkg_id) {
                            Some(fmri) => !removed.contains(fmri),
                            None => {
                                log::warn!("package id {} has no interned FMRI; keeping", pkg_id);
                                true
                            }
                        };
                        if keep {
                            out.entry(action_type.clone())
                                .or_default()
                                .entry(subtype.clone())
                                .or_default()
                                .entry(value.clone())
                                .or_default()
                                .insert(pkg_id, offsets);
                        }
                    }
                }
            }
        }
        out
    }

    /// Rewrite the small stores for the new generation: the existence set
    /// and its hash, the cleared fast logs, and the id map with every id
    /// that no longer appears in the dictionary freed for reuse.
    fn write_assistant_dicts(
        &mut self,
        scratch: &Path,
        adds: &BTreeSet<String>,
        removed: &BTreeSet<String>,
        seen_ids: &BTreeSet<u64>,
        version: u32,
    ) -> Result<(), IndexError> {
        let survivors: Vec<String> = self
            .full_fmri
            .iter()
            .filter(|f| !removed.contains(*f))
            .cloned()
            .collect();
        self.full_fmri.clear();
        for fmri in survivors {
            self.full_fmri.add(fmri);
        }
        for fmri in adds {
            self.full_fmri.add(fmri.clone());
        }
        self.hash.set_from(self.full_fmri.as_set());

        let unseen: Vec<u64> = self
            .id_map
            .ids()
            .filter(|(id, _)| !seen_ids.contains(id))
            .map(|(id, _)| id)
            .collect();
        for id in unseen {
            self.id_map.remove_id(id);
        }

        self.fast_add.write(scratch, version)?;
        self.fast_remove.write(scratch, version)?;
        self.id_map.write(scratch, version)?;
        self.full_fmri.write(scratch, version)?;
        self.hash.write(scratch, version)?;
        Ok(())
    }

    fn write_empty_stores(&mut self, version: u32) -> Result<(), IndexError> {
        self.reset_state();
        self.version = Some(version);
        self.fast_add.write(&self.index_dir, version)?;
        self.fast_remove.write(&self.index_dir, version)?;
        self.id_map.write(&self.index_dir, version)?;
        self.full_fmri.write(&self.index_dir, version)?;
        self.hash.write(&self.index_dir, version)?;

        let mut dict = BufWriter::new(File::create(self.index_dir.join(store::MAIN_DICT_FILE))?);
        write_version_line(&mut dict, version)?;
        dict.flush()?;
        self.token_offsets.open_out(&self.index_dir, version)?;
        self.token_offsets.close_out()?;
        self.inverted.clear();
        self.inverted.write(&self.index_dir, version, &self.id_map)?;
        Ok(())
    }

    /// Scratch starts clean every time. A leftover directory from an
    /// aborted run is cleared and reused rather than treated as an error.
    fn prepare_scratch(&self, scratch_override: Option<&Path>) -> Result<PathBuf, IndexError> {
        let scratch = match scratch_override {
            Some(p) => p.to_path_buf(),
            None => self.index_dir.join(TMP_DIR_NAME),
        };
        if scratch.exists() {
            log::debug!("clearing stale scratch directory {:?}", scratch);
            fs::remove_dir_all(&scratch).map_err(|e| self.map_fs(&scratch, e))?;
        }
        self.create_dir(&scratch)?;
        Ok(scratch)
    }

    /// Move the new generation's files from scratch into the live
    /// directory. In fast mode the main dictionary and both offset stores
    /// were never rewritten and stay put; a full publish also swaps the
    /// postings files and clears out the superseded legacy layout.
    fn migrate(&mut self, scratch: &Path, fast: bool) -> Result<(), IndexError> {
        let skip: &[&str] = if fast {
            &[
                store::MAIN_DICT_FILE,
                store::BYTE_OFFSET_FILE,
                store::FMRI_OFFSETS_FILE,
            ]
        } else {
            &[]
        };

        if !fast {
            remove_postings_files(&self.index_dir)?;
        }

        for entry in fs::read_dir(scratch)? {
            let entry = entry?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if name_str.starts_with(crate::spool::SORT_FILE_PREFIX) {
                continue;
            }
            if skip.contains(&name_str.as_ref()) {
                continue;
            }
            fs::rename(entry.path(), self.index_dir.join(&name))
                .map_err(|e| self.map_fs(&entry.path(), e))?;
        }

        if !fast {
            let legacy = self.index_dir.join(LEGACY_DIR_NAME);
            if legacy.is_dir() {
                if let Err(e) = fs::remove_dir_all(&legacy) {
                    log::warn!("could not remove legacy layout {:?}: {}", legacy, e);
                }
            }
        }

        fs::remove_dir_all(scratch)?;
        Ok(())
    }

    fn create_dir(&self, dir: &Path) -> Result<(), IndexError> {
        fs::create_dir_all(dir).map_err(|e| self.map_fs(dir, e))
    }

    fn map_fs(&self, path: &Path, e: std::io::Error) -> IndexError {
        if is_permission_error(&e) {
            IndexError::Permissions {
                path: path.to_path_buf(),
            }
        } else {
            e.into()
        }
    }
}

/// Streaming cursor over an existing main dictionary's records.
struct OldDictCursor {
    reader: BufReader<File>,
}

impl OldDictCursor {
    fn new(reader: BufReader<File>) -> Self {
        Self { reader }
    }

    fn next_record(&mut self) -> Result<Option<(String, OccurrenceTree)>, IndexError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        codec::decode_line(&line).map(Some)
    }
}

/// Append one offset line to the postings file for `key`, opening it on
/// first use. Postings files carry no version header; they are wholly
/// regenerated on every full rebuild.
fn postings_line(
    files: &mut HashMap<String, BufWriter<File>>,
    scratch: &Path,
    prefix: &str,
    key: &str,
    offset: u64,
) -> Result<(), IndexError> {
    if !files.contains_key(key) {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(scratch.join(format!("{}{}", prefix, key)))?;
        files.insert(key.to_string(), BufWriter::new(file));
    }
    let writer = files.get_mut(key).expect("just inserted");
    writeln!(writer, "{}", offset)?;
    Ok(())
}

/// Delete every per-action-type and per-subtype postings file in `dir`.
/// Run before a full publish so postings for vanished keys do not linger.
fn remove_postings_files(dir: &Path) -> Result<(), IndexError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(AT_FILE_PREFIX) || name.starts_with(ST_FILE_PREFIX) {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
