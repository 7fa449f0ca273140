//! End-to-end tests for index builds, fast updates, and the consistency gate

use std::fs;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use pkgdex::codec;
use pkgdex::engine::{EngineConfig, IndexEngine, PlanEntry, INITIAL_VERSION};
use pkgdex::lock::LockFile;
use pkgdex::manifest::{entry, MemorySource};
use pkgdex::store;
use pkgdex::IndexError;

fn test_config() -> EngineConfig {
    EngineConfig {
        file_open_timeout: Duration::from_millis(100),
        ..EngineConfig::default()
    }
}

fn engine_with(
    index_dir: &Path,
    source: MemorySource,
    config: EngineConfig,
) -> IndexEngine<MemorySource> {
    IndexEngine::new(index_dir, source, config)
}

/// Main dictionary content minus the version header.
fn dict_body(index_dir: &Path) -> Vec<String> {
    let content = fs::read_to_string(index_dir.join(store::MAIN_DICT_FILE)).unwrap();
    content.lines().skip(1).map(|l| l.to_string()).collect()
}

fn store_body(index_dir: &Path, name: &str) -> Vec<String> {
    let content = fs::read_to_string(index_dir.join(name)).unwrap();
    content.lines().skip(1).map(|l| l.to_string()).collect()
}

fn store_version(index_dir: &Path, name: &str) -> u32 {
    let content = fs::read_to_string(index_dir.join(name)).unwrap();
    content
        .lines()
        .next()
        .unwrap()
        .strip_prefix(store::VERSION_PREFIX)
        .unwrap()
        .parse()
        .unwrap()
}

fn two_package_source() -> MemorySource {
    let mut source = MemorySource::new();
    source.insert(
        "pkg://test/a@1.0",
        vec![entry("foo", "file", "basename", "usr/bin/foo", &[120])],
    );
    source.insert(
        "pkg://test/b@1.0",
        vec![entry("foo", "dir", "path", "etc/foo", &[88])],
    );
    source
}

#[test]
fn test_shared_token_merges_into_one_line() {
    let temp = TempDir::new().unwrap();
    let mut engine = engine_with(temp.path(), two_package_source(), test_config());
    let installed = vec![
        "pkg://test/a@1.0".to_string(),
        "pkg://test/b@1.0".to_string(),
    ];
    engine.server_update_index(&installed, None).unwrap();

    let body = dict_body(temp.path());
    assert_eq!(body.len(), 1, "one shared token means one dictionary line");
    let (token, tree) = codec::decode_line(&body[0]).unwrap();
    assert_eq!(token, "foo");
    assert!(tree.contains_key("file"));
    assert!(tree.contains_key("dir"));
    let file_pkgs: Vec<u64> = tree["file"]["basename"]["usr/bin/foo"]
        .keys()
        .copied()
        .collect();
    let dir_pkgs: Vec<u64> = tree["dir"]["path"]["etc/foo"].keys().copied().collect();
    assert_eq!(file_pkgs.len(), 1);
    assert_eq!(dir_pkgs.len(), 1);
    assert_ne!(file_pkgs[0], dir_pkgs[0]);

    // The token offset store has exactly one entry, pointing at the line.
    let offsets = store_body(temp.path(), store::BYTE_OFFSET_FILE);
    assert_eq!(offsets, vec![format!("0foo {}", "VERSION: 1\n".len())]);
}

#[test]
fn test_fast_update_leaves_main_dictionary_untouched() {
    let temp = TempDir::new().unwrap();
    let mut source = MemorySource::new();
    source.insert(
        "pkg://test/a@1.0",
        vec![entry("foo", "file", "basename", "usr/bin/foo", &[120])],
    );
    source.insert(
        "pkg://test/b@1.0",
        vec![entry("bar", "file", "basename", "usr/bin/bar", &[64])],
    );
    let mut engine = engine_with(temp.path(), source, test_config());
    engine
        .server_update_index(&["pkg://test/a@1.0".to_string()], None)
        .unwrap();

    let dict_before = fs::read(temp.path().join(store::MAIN_DICT_FILE)).unwrap();
    let version_before = store_version(temp.path(), store::FULL_FMRI_FILE);

    let plan = vec![PlanEntry::replace("pkg://test/a@1.0", "pkg://test/b@1.0")];
    engine
        .client_update_index(&plan, &["pkg://test/b@1.0".to_string()], None)
        .unwrap();

    // The dictionary and the generation number are untouched.
    let dict_after = fs::read(temp.path().join(store::MAIN_DICT_FILE)).unwrap();
    assert_eq!(dict_before, dict_after);
    assert_eq!(
        store_version(temp.path(), store::FULL_FMRI_FILE),
        version_before
    );

    // The logs and the existence set carry the delta.
    assert_eq!(
        store_body(temp.path(), store::FAST_ADD_FILE),
        vec!["pkg://test/b@1.0"]
    );
    assert_eq!(
        store_body(temp.path(), store::FAST_REMOVE_FILE),
        vec!["pkg://test/a@1.0"]
    );
    assert_eq!(
        store_body(temp.path(), store::FULL_FMRI_FILE),
        vec!["pkg://test/b@1.0"]
    );
}

#[test]
fn test_backlog_at_threshold_stays_fast_above_rebuilds() {
    let temp = TempDir::new().unwrap();
    let mut source = MemorySource::new();
    source.insert(
        "pkg://test/base@1.0",
        vec![entry("base", "file", "basename", "usr/bin/base", &[10])],
    );
    for n in 1..=3 {
        source.insert(
            &format!("pkg://test/p{}@1.0", n),
            vec![entry(
                &format!("tok{}", n),
                "file",
                "basename",
                &format!("usr/bin/p{}", n),
                &[n * 10],
            )],
        );
    }
    let config = EngineConfig {
        max_fast_indexed_pkgs: 2,
        ..test_config()
    };
    let mut engine = engine_with(temp.path(), source, config);
    engine
        .server_update_index(&["pkg://test/base@1.0".to_string()], None)
        .unwrap();
    let dict_before = fs::read(temp.path().join(store::MAIN_DICT_FILE)).unwrap();

    // Two pending additions sit exactly at the threshold: still fast.
    let plan = vec![
        PlanEntry::add("pkg://test/p1@1.0"),
        PlanEntry::add("pkg://test/p2@1.0"),
    ];
    let installed: Vec<String> = [
        "pkg://test/base@1.0",
        "pkg://test/p1@1.0",
        "pkg://test/p2@1.0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    engine.client_update_index(&plan, &installed, None).unwrap();
    assert_eq!(
        fs::read(temp.path().join(store::MAIN_DICT_FILE)).unwrap(),
        dict_before
    );
    assert_eq!(store_body(temp.path(), store::FAST_ADD_FILE).len(), 2);

    // One more pushes the backlog past the threshold: full rebuild.
    let plan = vec![PlanEntry::add("pkg://test/p3@1.0")];
    let mut installed = installed;
    installed.push("pkg://test/p3@1.0".to_string());
    engine.client_update_index(&plan, &installed, None).unwrap();

    assert!(store_body(temp.path(), store::FAST_ADD_FILE).is_empty());
    let tokens: Vec<String> = dict_body(temp.path())
        .iter()
        .map(|l| codec::decode_line(l).unwrap().0)
        .collect();
    assert_eq!(tokens, ["base", "tok1", "tok2", "tok3"]);
}

#[test]
fn test_existence_gate_trichotomy() {
    let temp = TempDir::new().unwrap();
    let mut engine = engine_with(temp.path(), two_package_source(), test_config());

    assert!(!engine.check_index_existence().unwrap());

    engine
        .server_update_index(&["pkg://test/a@1.0".to_string()], None)
        .unwrap();
    assert!(engine.check_index_existence().unwrap());

    fs::remove_file(temp.path().join(store::FAST_ADD_FILE)).unwrap();
    assert!(matches!(
        engine.check_index_existence(),
        Err(IndexError::InconsistentIndex { .. })
    ));
}

#[test]
fn test_fast_updates_then_merge_match_direct_build() {
    let installed = vec![
        "pkg://test/a@1.0".to_string(),
        "pkg://test/b@1.0".to_string(),
    ];

    // Path one: index a, fast-add b, then merge.
    let temp1 = TempDir::new().unwrap();
    let mut engine1 = engine_with(temp1.path(), two_package_source(), test_config());
    engine1
        .server_update_index(&["pkg://test/a@1.0".to_string()], None)
        .unwrap();
    engine1
        .client_update_index(&[PlanEntry::add("pkg://test/b@1.0")], &installed, None)
        .unwrap();
    engine1.server_update_index(&installed, None).unwrap();

    // Path two: index both directly.
    let temp2 = TempDir::new().unwrap();
    let mut engine2 = engine_with(temp2.path(), two_package_source(), test_config());
    engine2.server_update_index(&installed, None).unwrap();

    assert_eq!(dict_body(temp1.path()), dict_body(temp2.path()));
    assert_eq!(
        store_body(temp1.path(), store::FULL_FMRI_FILE),
        store_body(temp2.path(), store::FULL_FMRI_FILE)
    );
    assert!(store_body(temp1.path(), store::FAST_ADD_FILE).is_empty());
    assert!(store_body(temp1.path(), store::FAST_REMOVE_FILE).is_empty());
}

#[test]
fn test_pending_removal_filtered_by_merge() {
    let temp = TempDir::new().unwrap();
    let mut source = MemorySource::new();
    source.insert(
        "pkg://test/a@1.0",
        vec![entry("foo", "file", "basename", "usr/bin/foo", &[120])],
    );
    source.insert(
        "pkg://test/b@1.0",
        vec![entry("bar", "file", "basename", "usr/bin/bar", &[64])],
    );
    let mut engine = engine_with(temp.path(), source, test_config());
    let both = vec![
        "pkg://test/a@1.0".to_string(),
        "pkg://test/b@1.0".to_string(),
    ];
    engine.server_update_index(&both, None).unwrap();

    engine
        .client_update_index(
            &[PlanEntry::remove("pkg://test/a@1.0")],
            &["pkg://test/b@1.0".to_string()],
            None,
        )
        .unwrap();
    // Removal-only plans are always fast; the dictionary still has "foo".
    assert_eq!(dict_body(temp.path()).len(), 2);

    engine
        .server_update_index(&["pkg://test/b@1.0".to_string()], None)
        .unwrap();
    let tokens: Vec<String> = dict_body(temp.path())
        .iter()
        .map(|l| codec::decode_line(l).unwrap().0)
        .collect();
    assert_eq!(tokens, ["bar"]);
    assert_eq!(
        store_body(temp.path(), store::FULL_FMRI_FILE),
        vec!["pkg://test/b@1.0"]
    );
    assert!(store_body(temp.path(), store::FAST_REMOVE_FILE).is_empty());
}

#[test]
fn test_unreadable_manifest_is_skipped() {
    let temp = TempDir::new().unwrap();
    let mut source = MemorySource::new();
    source.insert(
        "pkg://test/a@1.0",
        vec![entry("foo", "file", "basename", "usr/bin/foo", &[120])],
    );
    // "pkg://test/ghost@1.0" has no manifest; the build carries on.
    let mut engine = engine_with(temp.path(), source, test_config());
    engine
        .server_update_index(
            &[
                "pkg://test/a@1.0".to_string(),
                "pkg://test/ghost@1.0".to_string(),
            ],
            None,
        )
        .unwrap();
    let tokens: Vec<String> = dict_body(temp.path())
        .iter()
        .map(|l| codec::decode_line(l).unwrap().0)
        .collect();
    assert_eq!(tokens, ["foo"]);
}

#[test]
fn test_rebuild_resets_generation() {
    let temp = TempDir::new().unwrap();
    let index_dir = temp.path().join("index");
    let installed = vec!["pkg://test/a@1.0".to_string()];
    let mut engine = engine_with(&index_dir, two_package_source(), test_config());

    engine.server_update_index(&installed, None).unwrap();
    engine.server_update_index(&installed, None).unwrap();
    assert_eq!(store_version(&index_dir, store::MAIN_DICT_FILE), 2);

    engine.rebuild_index_from_scratch(&installed, None).unwrap();
    assert_eq!(
        store_version(&index_dir, store::MAIN_DICT_FILE),
        INITIAL_VERSION
    );
    assert_eq!(dict_body(&index_dir).len(), 1);
}

#[test]
fn test_setup_seeds_empty_consistent_index() {
    let temp = TempDir::new().unwrap();
    let index_dir = temp.path().join("index");
    let mut engine = engine_with(&index_dir, MemorySource::new(), test_config());
    engine.setup().unwrap();
    assert!(engine.check_index_existence().unwrap());
    assert!(dict_body(&index_dir).is_empty());
    assert_eq!(
        store_version(&index_dir, store::MAIN_DICT_FILE),
        INITIAL_VERSION
    );
}

#[test]
fn test_update_fails_when_index_is_locked() {
    let temp = TempDir::new().unwrap();
    let mut holder = LockFile::new(temp.path(), "other-process");
    holder.lock(false).unwrap();

    let mut engine = engine_with(temp.path(), two_package_source(), test_config());
    let result = engine.server_update_index(&["pkg://test/a@1.0".to_string()], None);
    match result {
        Err(IndexError::Locked { holder, .. }) => {
            assert_eq!(holder.as_deref(), Some("other-process"));
        }
        other => panic!("expected lock contention, got {:?}", other.err()),
    }
}

#[test]
fn test_hash_check_matches_installed_set() {
    let temp = TempDir::new().unwrap();
    let mut engine = engine_with(temp.path(), two_package_source(), test_config());
    let installed = vec![
        "pkg://test/a@1.0".to_string(),
        "pkg://test/b@1.0".to_string(),
    ];
    engine.server_update_index(&installed, None).unwrap();

    assert!(engine.check_index_has_exactly_fmris(&installed).is_ok());
    assert!(matches!(
        engine.check_index_has_exactly_fmris(["pkg://test/a@1.0"]),
        Err(IndexError::HashMismatch { .. })
    ));
}

#[test]
fn test_postings_files_written_per_action_and_subtype() {
    let temp = TempDir::new().unwrap();
    let mut engine = engine_with(temp.path(), two_package_source(), test_config());
    engine
        .server_update_index(
            &[
                "pkg://test/a@1.0".to_string(),
                "pkg://test/b@1.0".to_string(),
            ],
            None,
        )
        .unwrap();

    for name in ["__at_file", "__at_dir", "__st_basename", "__st_path"] {
        let content = fs::read_to_string(temp.path().join(name)).unwrap();
        assert_eq!(content.lines().count(), 1, "{} should have one offset", name);
        let offset: u64 = content.trim().parse().unwrap();
        assert_eq!(offset, "VERSION: 1\n".len() as u64);
    }

    // A rebuild dropping the "dir" action removes its postings file.
    engine
        .rebuild_index_from_scratch(&["pkg://test/a@1.0".to_string()], None)
        .unwrap();
    assert!(!temp.path().join("__at_dir").exists());
    assert!(temp.path().join("__at_file").exists());
}
