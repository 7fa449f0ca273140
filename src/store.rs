//! On-disk store set backing the index
//!
//! One index generation is a fixed collection of flat files, each beginning
//! with a `VERSION: <n>` header line. Every file written in the same
//! generation carries the same version number; `consistent_open` is the gate
//! that decides whether a directory holds a complete generation, no
//! generation, or a corrupt partial one.
//!
//! The shapes here are small and deliberate:
//! - sets of strings (fast-add / fast-remove logs, the FMRI existence set),
//! - a bidirectional id <-> string interning list (line N is the string for
//!   id N, a blank line is a reusable slot),
//! - a token -> byte-offset map streamed out while the main dictionary is
//!   written,
//! - an inverted package -> offsets map, delta-encoded with shared offset
//!   sets de-duplicated,
//! - a single-line hash of the installed set for cheap "is the index
//!   current" checks.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::codec::{quote, unquote};
use crate::errors::IndexError;

pub const VERSION_PREFIX: &str = "VERSION: ";

pub const FAST_ADD_FILE: &str = "fast_add.v1";
pub const FAST_REMOVE_FILE: &str = "fast_remove.v1";
pub const MANIFEST_LIST_FILE: &str = "manf_list.v1";
pub const FULL_FMRI_FILE: &str = "full_fmri_list";
pub const FULL_FMRI_HASH_FILE: &str = "full_fmri_list.hash";
pub const MAIN_DICT_FILE: &str = "main_dict.ascii.v2";
pub const BYTE_OFFSET_FILE: &str = "token_byte_offset.v1";
pub const FMRI_OFFSETS_FILE: &str = "fmri_offsets.v1";

/// Every file that makes up one index generation, in a fixed order.
pub fn store_file_names() -> [&'static str; 8] {
    [
        FAST_ADD_FILE,
        FAST_REMOVE_FILE,
        MANIFEST_LIST_FILE,
        FULL_FMRI_FILE,
        FULL_FMRI_HASH_FILE,
        MAIN_DICT_FILE,
        BYTE_OFFSET_FILE,
        FMRI_OFFSETS_FILE,
    ]
}

/// Write the shared generation header.
pub fn write_version_line<W: Write>(writer: &mut W, version: u32) -> std::io::Result<()> {
    writeln!(writer, "{}{}", VERSION_PREFIX, version)
}

/// Read and parse the generation header from the start of a store file.
pub fn read_version_line<R: BufRead>(reader: &mut R) -> Result<u32, IndexError> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let line = line.trim_end_matches('\n');
    let num = line
        .strip_prefix(VERSION_PREFIX)
        .ok_or_else(|| IndexError::parse(line, "missing version header"))?;
    num.parse()
        .map_err(|_| IndexError::parse(line, "bad version number"))
}

enum ProbeResult {
    AllPresent(u32),
    NonePresent,
    Mixed,
}

fn probe_versions(dir: &Path, names: &[&str]) -> Result<ProbeResult, IndexError> {
    let mut missing: Option<bool> = None;
    let mut version: Option<u32> = None;
    for name in names {
        match File::open(dir.join(name)) {
            Ok(file) => {
                if missing == Some(true) {
                    return Ok(ProbeResult::Mixed);
                }
                missing = Some(false);
                let v = read_version_line(&mut BufReader::new(file))?;
                match version {
                    None => version = Some(v),
                    Some(expected) if expected != v => return Ok(ProbeResult::Mixed),
                    Some(_) => {}
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if missing == Some(false) {
                    return Ok(ProbeResult::Mixed);
                }
                missing = Some(true);
            }
            Err(e) => return Err(e.into()),
        }
    }
    match missing {
        Some(true) | None => Ok(ProbeResult::NonePresent),
        Some(false) => Ok(ProbeResult::AllPresent(version.expect("opened at least one"))),
    }
}

/// Open every named store in `dir` and check that the set is complete with a
/// single shared version. Returns `Some(version)` when all files are present
/// and agree, `None` when none exist. A mixed state is retried for `timeout`
/// (another process may be mid-publish) and then reported as an inconsistent
/// index. All file handles are released before returning, on every path.
pub fn consistent_open(
    dir: &Path,
    names: &[&str],
    timeout: Duration,
) -> Result<Option<u32>, IndexError> {
    let start = Instant::now();
    loop {
        match probe_versions(dir, names)? {
            ProbeResult::AllPresent(v) => return Ok(Some(v)),
            ProbeResult::NonePresent => return Ok(None),
            ProbeResult::Mixed => {
                if start.elapsed() > timeout {
                    return Err(IndexError::InconsistentIndex {
                        dir: dir.to_path_buf(),
                    });
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn create_store_file(dir: &Path, name: &str, version: u32) -> Result<BufWriter<File>, IndexError> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dir.join(name))?;
    let mut writer = BufWriter::new(file);
    write_version_line(&mut writer, version)?;
    Ok(writer)
}

fn open_store_file(dir: &Path, name: &str) -> Result<(BufReader<File>, u32), IndexError> {
    let file = File::open(dir.join(name))?;
    let mut reader = BufReader::new(file);
    let version = read_version_line(&mut reader)?;
    Ok((reader, version))
}

/// A named set-of-strings store, one member per line.
#[derive(Debug)]
pub struct SetStore {
    name: &'static str,
    set: BTreeSet<String>,
}

impl SetStore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            set: BTreeSet::new(),
        }
    }

    pub fn file_name(&self) -> &'static str {
        self.name
    }

    pub fn add(&mut self, entity: String) {
        self.set.insert(entity);
    }

    pub fn remove(&mut self, entity: &str) -> bool {
        self.set.remove(entity)
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.set.contains(entity)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.set.iter()
    }

    pub fn as_set(&self) -> &BTreeSet<String> {
        &self.set
    }

    pub fn clear(&mut self) {
        self.set.clear();
    }

    pub fn read(&mut self, dir: &Path) -> Result<u32, IndexError> {
        let (reader, version) = open_store_file(dir, self.name)?;
        self.set.clear();
        for line in reader.lines() {
            self.set.insert(line?);
        }
        Ok(version)
    }

    pub fn write(&self, dir: &Path, version: u32) -> Result<(), IndexError> {
        let mut writer = create_store_file(dir, self.name, version)?;
        for entity in &self.set {
            writeln!(writer, "{}", entity)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Bidirectional string <-> small-integer interning store. Ids are line
/// numbers in the backing file; removing an entity leaves a blank line whose
/// id is reused by a later addition.
#[derive(Debug, Default)]
pub struct IdMapStore {
    name: &'static str,
    list: Vec<String>,
    map: HashMap<String, u64>,
    free: VecDeque<u64>,
}

impl IdMapStore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            list: Vec::new(),
            map: HashMap::new(),
            free: VecDeque::new(),
        }
    }

    pub fn file_name(&self) -> &'static str {
        self.name
    }

    /// Intern `entity`, reusing a freed slot when one is available.
    pub fn get_id_and_add(&mut self, entity: &str) -> u64 {
        if let Some(&id) = self.map.get(entity) {
            return id;
        }
        let id = match self.free.pop_front() {
            Some(id) => {
                self.list[id as usize] = entity.to_string();
                id
            }
            None => {
                self.list.push(entity.to_string());
                (self.list.len() - 1) as u64
            }
        };
        self.map.insert(entity.to_string(), id);
        id
    }

    pub fn get_id(&self, entity: &str) -> Option<u64> {
        self.map.get(entity).copied()
    }

    pub fn get_entity(&self, id: u64) -> Option<&str> {
        match self.list.get(id as usize) {
            Some(s) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn remove_entity(&mut self, entity: &str) {
        if let Some(id) = self.map.remove(entity) {
            self.list[id as usize].clear();
            self.free.push_back(id);
        }
    }

    pub fn remove_id(&mut self, id: u64) {
        if let Some(entity) = self.list.get(id as usize) {
            if !entity.is_empty() {
                self.map.remove(&entity.clone());
                self.list[id as usize].clear();
                self.free.push_back(id);
            }
        }
    }

    /// Iterate live (id, entity) pairs.
    pub fn ids(&self) -> impl Iterator<Item = (u64, &str)> {
        self.list
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_empty())
            .map(|(i, s)| (i as u64, s.as_str()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.list.clear();
        self.map.clear();
        self.free.clear();
    }

    pub fn read(&mut self, dir: &Path) -> Result<u32, IndexError> {
        let (reader, version) = open_store_file(dir, self.name)?;
        self.clear();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                self.free.push_back(i as u64);
            } else {
                self.map.insert(line.clone(), i as u64);
            }
            self.list.push(line);
        }
        Ok(version)
    }

    pub fn write(&self, dir: &Path, version: u32) -> Result<(), IndexError> {
        let mut writer = create_store_file(dir, self.name, version)?;
        for entity in &self.list {
            writeln!(writer, "{}", entity)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Token -> main-dictionary byte offset store. Entries are streamed out one
/// at a time while the main dictionary is written, so the writer keeps an
/// open handle between `open_out` and `close_out`. Tokens containing a space
/// are stored quoted with a `1` flag prefix; all others raw behind a `0`.
#[derive(Debug, Default)]
pub struct OffsetStore {
    name: &'static str,
    map: BTreeMap<String, u64>,
    out: Option<BufWriter<File>>,
}

impl OffsetStore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            map: BTreeMap::new(),
            out: None,
        }
    }

    pub fn file_name(&self) -> &'static str {
        self.name
    }

    pub fn open_out(&mut self, dir: &Path, version: u32) -> Result<(), IndexError> {
        self.out = Some(create_store_file(dir, self.name, version)?);
        Ok(())
    }

    pub fn write_entity(&mut self, token: &str, offset: u64) -> Result<(), IndexError> {
        let writer = self
            .out
            .as_mut()
            .ok_or_else(|| IndexError::parse(token, "offset store not open for writing"))?;
        if token.contains(' ') {
            writeln!(writer, "1{} {}", quote(token), offset)?;
        } else {
            writeln!(writer, "0{} {}", token, offset)?;
        }
        Ok(())
    }

    pub fn close_out(&mut self) -> Result<(), IndexError> {
        if let Some(mut writer) = self.out.take() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn get(&self, token: &str) -> Option<u64> {
        self.map.get(token).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn read(&mut self, dir: &Path) -> Result<u32, IndexError> {
        let (reader, version) = open_store_file(dir, self.name)?;
        self.map.clear();
        for line in reader.lines() {
            let line = line?;
            let (tok_field, off_field) = line
                .rsplit_once(' ')
                .ok_or_else(|| IndexError::parse(&line, "missing offset field"))?;
            let token = match tok_field.split_at_checked(1) {
                Some(("1", rest)) => unquote(rest)?,
                Some(("0", rest)) => rest.to_string(),
                _ => return Err(IndexError::parse(&line, "bad token flag")),
            };
            let offset: u64 = off_field
                .parse()
                .map_err(|_| IndexError::parse(&line, "bad offset"))?;
            self.map.insert(token, offset);
        }
        Ok(version)
    }
}

/// Inverted package -> main-dictionary-offsets store. Offsets are collected
/// by package id while the dictionary is written; on write each package's
/// offsets are sorted, de-duplicated, and delta-encoded, and packages that
/// share an identical offset set share one line:
///
/// ```text
/// pkg://a@1.0 pkg://b@1.0!120 45 33
/// ```
#[derive(Debug, Default)]
pub struct InvertedStore {
    name: &'static str,
    offsets: BTreeMap<u64, Vec<u64>>,
}

impl InvertedStore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            offsets: BTreeMap::new(),
        }
    }

    pub fn file_name(&self) -> &'static str {
        self.name
    }

    pub fn add_pair(&mut self, pkg_id: u64, offset: u64) {
        self.offsets.entry(pkg_id).or_default().push(offset);
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
    }

    pub fn write(&self, dir: &Path, version: u32, ids: &IdMapStore) -> Result<(), IndexError> {
        // Group package ids by their delta-encoded offset string so shared
        // offset sets are stored once.
        let mut grouped: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (&pkg_id, offsets) in &self.offsets {
            let mut offs = offsets.clone();
            offs.sort_unstable();
            offs.dedup();
            let mut prev = 0;
            let deltas: Vec<String> = offs
                .iter()
                .map(|&o| {
                    let d = o - prev;
                    prev = o;
                    d.to_string()
                })
                .collect();
            grouped.entry(deltas.join(" ")).or_default().push(pkg_id);
        }

        let mut writer = create_store_file(dir, self.name, version)?;
        for (delta_str, pkg_ids) in &grouped {
            let fmris: Vec<&str> = pkg_ids
                .iter()
                .filter_map(|&id| {
                    let entity = ids.get_entity(id);
                    if entity.is_none() {
                        log::warn!("package id {} has no interned FMRI; dropping", id);
                    }
                    entity
                })
                .collect();
            if fmris.is_empty() {
                continue;
            }
            writeln!(writer, "{}!{}", fmris.join(" "), delta_str)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Single-line store holding a hash of the sorted installed-FMRI set.
/// Lets a caller answer "does this index cover exactly these packages?"
/// without reading the existence set.
#[derive(Debug)]
pub struct HashStore {
    name: &'static str,
    hash: String,
}

impl HashStore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            hash: Self::calc_hash(std::iter::empty::<&String>()),
        }
    }

    pub fn file_name(&self) -> &'static str {
        self.name
    }

    /// Hash an iterator of FMRI strings, order-insensitively.
    pub fn calc_hash<I, S>(vals: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut sorted: Vec<String> = vals.into_iter().map(|s| s.as_ref().to_string()).collect();
        sorted.sort();
        let mut hasher = blake3::Hasher::new();
        for v in &sorted {
            hasher.update(v.as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }

    pub fn set_from(&mut self, vals: &BTreeSet<String>) {
        self.hash = Self::calc_hash(vals.iter());
    }

    pub fn clear(&mut self) {
        self.hash = Self::calc_hash(std::iter::empty::<&String>());
    }

    /// Compare the stored hash against a candidate set; a mismatch is the
    /// distinguished hash error so callers can report both values.
    pub fn check_against<I, S>(&self, vals: I) -> Result<(), IndexError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let incoming = Self::calc_hash(vals);
        if self.hash != incoming {
            return Err(IndexError::HashMismatch {
                existing: self.hash.clone(),
                incoming,
            });
        }
        Ok(())
    }

    pub fn read(&mut self, dir: &Path) -> Result<u32, IndexError> {
        let (reader, version) = open_store_file(dir, self.name)?;
        if let Some(line) = reader.lines().next() {
            self.hash = line?;
        }
        Ok(version)
    }

    pub fn write(&self, dir: &Path, version: u32) -> Result<(), IndexError> {
        let mut writer = create_store_file(dir, self.name, version)?;
        writeln!(writer, "{}", self.hash)?;
        writer.flush()?;
        Ok(())
    }
}
