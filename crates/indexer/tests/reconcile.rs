use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use treegrok_indexer::{
    IndexChangeListener, IndexRunner, IndexStore, IndexerConfig, ProjectConfig, ProjectStats,
    RunReport, SegmentStore, UidKey, FULL_FIELD,
};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn sorted(&self) -> Vec<String> {
        let mut events = self.events.lock().clone();
        events.sort();
        events
    }
}

impl IndexChangeListener for Recorder {
    fn file_added(&self, path: &str, _analyzer: &str) {
        self.events.lock().push(format!("+{path}"));
    }

    fn file_removed(&self, path: &str) {
        self.events.lock().push(format!("-{path}"));
    }
}

struct Fixture {
    _src: TempDir,
    _data: TempDir,
    root: PathBuf,
    config: IndexerConfig,
}

impl Fixture {
    fn new() -> Self {
        let src = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let root = src.path().canonicalize().unwrap();
        let mut config = IndexerConfig::new(&root, data.path());
        config.parallelism = 2;
        config.progress_interval_secs = 0;
        config.optimize = false;
        Self {
            _src: src,
            _data: data,
            root,
            config,
        }
    }

    fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn run(&self) -> (RunReport, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut runner = IndexRunner::new(self.config.clone()).unwrap();
        runner.add_listener(recorder.clone());
        let report = runner.run().unwrap();
        (report, recorder)
    }

    fn index_dir(&self, project: Option<&ProjectConfig>) -> PathBuf {
        self.config.index_dir(project)
    }

    fn indexed(&self, project: Option<&ProjectConfig>) -> Vec<UidKey> {
        let store = SegmentStore::open(&self.index_dir(project), false).unwrap();
        store.uids_from("").collect()
    }

    fn indexed_paths(&self) -> Vec<String> {
        self.indexed(None).iter().map(UidKey::path).collect()
    }

    fn is_dirty(&self) -> bool {
        self.index_dir(None).join("dirty").exists()
    }

    fn stats(report: &RunReport) -> ProjectStats {
        report.projects[0].stats.clone().unwrap()
    }

    /// Rewrite the stored document of `rel` in place.
    fn edit_document(&self, rel: &str, edit: impl FnOnce(&mut treegrok_indexer::Document)) {
        let mut store = SegmentStore::open(&self.index_dir(None), true).unwrap();
        let uid = expected_uid(&self.root, rel);
        let mut doc = store.document(&uid).cloned().unwrap();
        edit(&mut doc);
        store.add_document(doc).unwrap();
        store.commit().unwrap();
    }
}

fn set_mtime(path: &Path, secs: u64) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

fn expected_uid(root: &Path, rel: &str) -> UidKey {
    let modified = fs::metadata(root.join(rel.trim_start_matches('/')))
        .unwrap()
        .modified()
        .unwrap();
    UidKey::from_modified(rel, modified)
}

#[test]
fn added_unchanged_and_deleted_files() {
    let fx = Fixture::new();
    fx.write("b.txt", "bravo");
    let c = fx.write("c.txt", "charlie");
    fx.run();
    assert!(fx.config.xref_path("/c.txt").exists());

    fs::remove_file(c).unwrap();
    fx.write("a.txt", "alpha");
    let (report, recorder) = fx.run();

    assert_eq!(recorder.sorted(), vec!["+/a.txt", "-/c.txt"]);
    assert!(!fx.config.xref_path("/c.txt").exists());
    assert!(fx.config.xref_path("/a.txt").exists());
    assert!(fx.is_dirty());

    let stats = report.projects[0].stats.clone().unwrap();
    assert_eq!((stats.added, stats.removed, stats.unchanged), (1, 1, 1));
    assert!(stats.dirty);
    assert!(report.is_success());
}

#[test]
fn pass_converges_to_disk_state() {
    let fx = Fixture::new();
    for rel in ["keep.txt", "dir/one.rs", "dir/two.rs", "gone/old.txt"] {
        fx.write(rel, rel);
    }
    fx.run();

    fs::remove_dir_all(fx.root.join("gone")).unwrap();
    fx.write("dir/three.rs", "three");
    fx.write("new/deep/file.c", "int x;");
    fx.run();

    let expected: Vec<UidKey> = [
        "/dir/one.rs",
        "/dir/three.rs",
        "/dir/two.rs",
        "/keep.txt",
        "/new/deep/file.c",
    ]
    .iter()
    .map(|rel| expected_uid(&fx.root, rel))
    .collect();
    assert_eq!(fx.indexed(None), expected);
}

#[test]
fn second_pass_without_changes_is_silent() {
    let mut fx = Fixture::new();
    fx.config.optimize = true;
    fx.write("a.txt", "a");
    fx.write("sub/b.txt", "b");

    let (first, _) = fx.run();
    assert!(first.projects[0].stats.as_ref().unwrap().optimized);
    assert!(!fx.is_dirty());

    let (second, recorder) = fx.run();
    assert_eq!(recorder.sorted(), Vec::<String>::new());
    assert!(!fx.is_dirty());
    let stats = second.projects[0].stats.clone().unwrap();
    assert_eq!((stats.added, stats.removed, stats.unchanged), (0, 0, 2));
}

#[test]
fn optimize_collapses_segments() {
    let mut fx = Fixture::new();
    fx.write("a.txt", "a");
    fx.run();
    fx.write("b.txt", "b");
    fx.run();
    {
        let store = SegmentStore::open(&fx.index_dir(None), false).unwrap();
        assert_eq!(store.segment_count(), 2);
    }

    fx.config.optimize = true;
    fx.write("c.txt", "c");
    fx.run();
    let store = SegmentStore::open(&fx.index_dir(None), false).unwrap();
    assert_eq!(store.segment_count(), 1);
    assert_eq!(store.num_docs(), 3);
    assert!(!fx.is_dirty());
    assert!(fx.config.spelling_dir(None).join("spelling.json").exists());
}

#[test]
fn deleted_subtree_at_the_end_is_cleaned_up() {
    let fx = Fixture::new();
    fx.write("a.txt", "a");
    for rel in ["z/1.txt", "z/2.txt", "zz/3.txt"] {
        fx.write(rel, rel);
    }
    fx.run();

    fs::remove_dir_all(fx.root.join("z")).unwrap();
    fs::remove_dir_all(fx.root.join("zz")).unwrap();
    let (_, recorder) = fx.run();

    assert_eq!(recorder.sorted(), vec!["-/z/1.txt", "-/z/2.txt", "-/zz/3.txt"]);
    assert_eq!(fx.indexed_paths(), vec!["/a.txt"]);
    assert!(!fx.config.xref_root().join("z").exists());
}

#[test]
fn modified_file_is_replaced() {
    let fx = Fixture::new();
    let path = fx.write("a.txt", "before");
    fx.run();

    fs::write(&path, "after_edit").unwrap();
    set_mtime(&path, 2_000_000_000);
    let (_, recorder) = fx.run();

    assert_eq!(recorder.sorted(), vec!["+/a.txt", "-/a.txt"]);
    assert_eq!(fx.indexed(None), vec![UidKey::new("/a.txt", 2_000_000_000_000)]);
    let xref = fs::read_to_string(fx.config.xref_path("/a.txt")).unwrap();
    assert!(xref.contains("after_edit"));
}

#[test]
fn ignored_names_never_enter_the_index() {
    let mut fx = Fixture::new();
    fx.config.ignored_names.push("*.o".to_string());
    fx.config.ignored_names.push("d:build".to_string());
    fx.write("main.c", "int main;");
    fx.write("main.o", "obj");
    fx.write(".git/HEAD", "ref");
    fx.write("build/out.c", "gen");
    fx.write("notes.txt~", "backup");
    fx.run();

    assert_eq!(fx.indexed_paths(), vec!["/main.c"]);
}

#[cfg(unix)]
#[test]
fn symlinks_never_enter_the_index() {
    let fx = Fixture::new();
    let target = fx.write("real/a.txt", "a");
    std::os::unix::fs::symlink(&target, fx.root.join("link.txt")).unwrap();
    std::os::unix::fs::symlink(fx.root.join("real"), fx.root.join("linked")).unwrap();
    fx.run();

    assert_eq!(fx.indexed_paths(), vec!["/real/a.txt"]);
}

#[test]
fn data_root_inside_source_root_is_skipped() {
    let mut fx = Fixture::new();
    fx.config.data_root = fx.root.join("data");
    fx.write("a.txt", "a");
    fx.run();
    fx.run();

    assert_eq!(fx.indexed_paths(), vec!["/a.txt"]);
}

#[test]
fn projects_use_separate_stores() {
    let mut fx = Fixture::new();
    let p1 = ProjectConfig::new("p1", "/p1");
    let p2 = ProjectConfig::new("p2", "/p2");
    fx.config.projects = vec![p1.clone(), p2.clone()];
    fx.write("p1/a.txt", "a");
    fx.write("p2/b.txt", "b");
    fx.write("loose.txt", "not in any project");

    let (report, recorder) = fx.run();
    assert_eq!(report.projects.len(), 2);
    assert!(report.is_success());
    assert_eq!(recorder.sorted(), vec!["+/p1/a.txt", "+/p2/b.txt"]);

    let paths = |p: &ProjectConfig| -> Vec<String> {
        fx.indexed(Some(p)).iter().map(UidKey::path).collect()
    };
    assert_eq!(paths(&p1), vec!["/p1/a.txt"]);
    assert_eq!(paths(&p2), vec!["/p2/b.txt"]);
    assert!(fx.config.timestamp_path().exists());
}

#[test]
fn missing_project_fails_alone() {
    let mut fx = Fixture::new();
    fx.config.projects = vec![
        ProjectConfig::new("ok", "/ok"),
        ProjectConfig::new("missing", "/missing"),
    ];
    fx.write("ok/a.txt", "a");

    let (report, _) = fx.run();
    assert!(!report.is_success());
    let ok = report.projects.iter().find(|p| p.name == "ok").unwrap();
    assert_eq!(ok.stats.as_ref().unwrap().added, 1);
    let missing = report.projects.iter().find(|p| p.name == "missing").unwrap();
    assert!(missing.error.is_some());
}

#[test]
fn cancelled_run_removes_nothing() {
    let fx = Fixture::new();
    fx.write("a.txt", "a");
    fx.write("b/c.txt", "c");
    fx.run();

    let recorder = Arc::new(Recorder::default());
    let mut runner = IndexRunner::new(fx.config.clone()).unwrap();
    runner.add_listener(recorder.clone());
    runner.cancellation_token().cancel();
    let report = runner.run().unwrap();

    assert!(report.cancelled);
    assert!(report.projects[0].stats.as_ref().unwrap().cancelled);
    assert_eq!(recorder.sorted(), Vec::<String>::new());
    assert_eq!(fx.indexed_paths(), vec!["/a.txt", "/b/c.txt"]);
}

#[test]
fn stale_lock_of_dead_process_is_recovered() {
    let fx = Fixture::new();
    fx.write("a.txt", "a");
    let index_dir = fx.index_dir(None);
    fs::create_dir_all(&index_dir).unwrap();
    fs::write(index_dir.join("write.lock"), "999999999").unwrap();

    let (report, _) = fx.run();
    assert!(report.is_success());
    assert_eq!(fx.indexed_paths(), vec!["/a.txt"]);
    assert!(!index_dir.join("write.lock").exists());
}

#[test]
fn live_lock_holder_aborts_the_project() {
    let fx = Fixture::new();
    fx.write("a.txt", "a");
    let index_dir = fx.index_dir(None);
    fs::create_dir_all(&index_dir).unwrap();
    fs::write(index_dir.join("write.lock"), std::process::id().to_string()).unwrap();

    let (report, recorder) = fx.run();
    assert!(!report.is_success());
    let error = report.projects[0].error.clone().unwrap();
    assert!(error.contains("locked"), "{error}");
    assert_eq!(recorder.sorted(), Vec::<String>::new());
    assert!(index_dir.join("write.lock").exists());
}

#[test]
fn timestamp_is_touched_only_on_change() {
    let fx = Fixture::new();
    fx.run();
    assert!(!fx.config.timestamp_path().exists());

    fx.write("a.txt", "a");
    fx.run();
    let stamp = fs::read_to_string(fx.config.timestamp_path()).unwrap();
    let ms: u128 = stamp.parse().unwrap();
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis();
    assert!(ms <= now);
}

#[test]
fn file_replaced_by_directory_converges() {
    let fx = Fixture::new();
    let a = fx.write("a", "plain file");
    fx.write("b.txt", "bravo");
    fx.run();
    assert!(fx.config.xref_path("/a").is_file());

    fs::remove_file(a).unwrap();
    fx.write("a/x.txt", "now a directory");
    let (report, recorder) = fx.run();

    assert!(report.is_success(), "{report:?}");
    assert_eq!(recorder.sorted(), vec!["+/a/x.txt", "-/a"]);
    assert_eq!(fx.indexed_paths(), vec!["/a/x.txt", "/b.txt"]);
    assert!(fx.config.xref_path("/a/x.txt").is_file());

    let (report, _) = fx.run();
    let stats = Fixture::stats(&report);
    assert_eq!((stats.added, stats.removed, stats.unchanged), (0, 0, 2));
}

#[test]
fn directory_replaced_by_file_converges() {
    let fx = Fixture::new();
    fx.write("a/x.txt", "inside");
    fx.write("a/deeper/y.txt", "deeper");
    fx.write("b.txt", "bravo");
    fx.run();

    fs::remove_dir_all(fx.root.join("a")).unwrap();
    fx.write("a", "now a file");
    let (report, _) = fx.run();

    assert!(report.is_success(), "{report:?}");
    assert_eq!(fx.indexed_paths(), vec!["/a", "/b.txt"]);
    let xref = fs::read_to_string(fx.config.xref_path("/a")).unwrap();
    assert!(xref.contains("now a file"));
}

#[test]
fn staged_xrefs_are_swept_after_a_run() {
    let fx = Fixture::new();
    fx.write("dir/a.txt", "a");
    let (report, _) = fx.run();

    assert!(report.is_success());
    assert!(fx.config.xref_path("/dir/a.txt").is_file());
    assert!(!fx.config.staging_dir().exists());
}

#[test]
fn missing_xref_of_unchanged_file_is_regenerated() {
    let fx = Fixture::new();
    fx.write("a.txt", "alpha");
    fx.write("b.txt", "bravo");
    fx.run();
    fs::remove_file(fx.config.xref_path("/a.txt")).unwrap();

    let (report, recorder) = fx.run();

    let stats = Fixture::stats(&report);
    assert_eq!((stats.refreshed, stats.unchanged, stats.added), (1, 1, 0));
    assert_eq!(recorder.sorted(), vec!["+/a.txt"]);
    assert!(fx.config.xref_path("/a.txt").is_file());
    assert_eq!(fx.indexed_paths(), vec!["/a.txt", "/b.txt"]);
}

#[test]
fn toggling_xref_generation_updates_unchanged_files() {
    let mut fx = Fixture::new();
    fx.config.generate_xref = false;
    fx.write("a.txt", "alpha");
    fx.run();
    assert!(!fx.config.xref_path("/a.txt").exists());

    fx.config.generate_xref = true;
    let (report, _) = fx.run();
    assert_eq!(Fixture::stats(&report).refreshed, 1);
    assert!(fx.config.xref_path("/a.txt").is_file());

    fx.config.generate_xref = false;
    let (report, _) = fx.run();
    let stats = Fixture::stats(&report);
    assert_eq!((stats.refreshed, stats.unchanged), (0, 1));
    assert!(!fx.config.xref_path("/a.txt").exists());
    assert_eq!(fx.indexed_paths(), vec!["/a.txt"]);
}

#[test]
fn documents_of_an_older_or_unknown_analyzer_are_reindexed() {
    let fx = Fixture::new();
    fx.write("a.txt", "alpha");
    fx.write("b.txt", "bravo");
    fx.run();
    fx.edit_document("/a.txt", |doc| doc.analyzer_version = 0);
    fx.edit_document("/b.txt", |doc| doc.analyzer = "retired".to_string());

    let (report, _) = fx.run();
    assert_eq!(Fixture::stats(&report).refreshed, 2);

    let store = SegmentStore::open(&fx.index_dir(None), false).unwrap();
    for rel in ["/a.txt", "/b.txt"] {
        let doc = store.document(&expected_uid(&fx.root, rel)).unwrap();
        assert_eq!((doc.analyzer.as_str(), doc.analyzer_version), ("plain", 1));
    }
    assert_eq!(store.num_docs(), 2);
}

#[cfg(unix)]
#[test]
fn unreadable_new_file_is_picked_up_once_readable() {
    let fx = Fixture::new();
    let a = fx.write("a.txt", "alpha");
    set_mode(&a, 0o000);
    if fs::File::open(&a).is_ok() {
        // Permission bits do not bind this user.
        return;
    }

    let (report, recorder) = fx.run();
    let stats = Fixture::stats(&report);
    assert_eq!((stats.added, stats.failed), (0, 1));
    assert_eq!(recorder.sorted(), Vec::<String>::new());
    assert_eq!(fx.indexed_paths(), Vec::<String>::new());

    set_mode(&a, 0o644);
    let (report, _) = fx.run();
    assert_eq!(Fixture::stats(&report).added, 1);
    assert_eq!(fx.indexed_paths(), vec!["/a.txt"]);
}

#[cfg(unix)]
#[test]
fn unreadable_changed_file_keeps_its_previous_entry() {
    let fx = Fixture::new();
    let a = fx.write("a.txt", "before");
    set_mtime(&a, 1_000_000_000);
    fx.run();

    fs::write(&a, "after").unwrap();
    set_mtime(&a, 2_000_000_000);
    set_mode(&a, 0o000);
    if fs::File::open(&a).is_ok() {
        return;
    }

    let (report, recorder) = fx.run();
    let stats = Fixture::stats(&report);
    assert_eq!((stats.added, stats.removed, stats.failed), (0, 0, 1));
    assert_eq!(recorder.sorted(), Vec::<String>::new());
    assert_eq!(fx.indexed(None), vec![UidKey::new("/a.txt", 1_000_000_000_000)]);
    let xref = fs::read_to_string(fx.config.xref_path("/a.txt")).unwrap();
    assert!(xref.contains("before"));

    set_mode(&a, 0o644);
    fx.run();
    assert_eq!(fx.indexed(None), vec![UidKey::new("/a.txt", 2_000_000_000_000)]);
}

#[cfg(unix)]
#[test]
fn unlistable_directory_drops_out_until_restored() {
    let fx = Fixture::new();
    fx.write("b.txt", "bravo");
    fx.write("d/x.txt", "hidden soon");
    fx.run();

    let d = fx.root.join("d");
    set_mode(&d, 0o000);
    if fs::read_dir(&d).is_ok() {
        set_mode(&d, 0o755);
        return;
    }
    let (report, _) = fx.run();
    set_mode(&d, 0o755);

    assert!(report.is_success());
    assert_eq!(Fixture::stats(&report).removed, 1);
    assert_eq!(fx.indexed_paths(), vec!["/b.txt"]);

    fx.run();
    assert_eq!(fx.indexed_paths(), vec!["/b.txt", "/d/x.txt"]);
}

#[test]
fn updating_one_directory_leaves_the_rest_alone() {
    let fx = Fixture::new();
    fx.write("a/old.txt", "old");
    fx.write("b/kept.txt", "kept");
    fx.run();

    fs::remove_file(fx.root.join("a/old.txt")).unwrap();
    fx.write("a/new.txt", "new");
    fx.write("b/later.txt", "not yet");

    let recorder = Arc::new(Recorder::default());
    let mut runner = IndexRunner::new(fx.config.clone()).unwrap();
    runner.add_listener(recorder.clone());
    let report = runner.run_paths(&["/a", "a/", "/missing"]).unwrap();

    assert!(report.is_success());
    assert_eq!(recorder.sorted(), vec!["+/a/new.txt", "-/a/old.txt"]);
    assert_eq!(fx.indexed_paths(), vec!["/a/new.txt", "/b/kept.txt"]);
    assert!(!fx.config.xref_path("/a/old.txt").exists());
}

#[test]
fn directory_updates_go_to_the_owning_project() {
    let mut fx = Fixture::new();
    let p1 = ProjectConfig::new("p1", "/p1");
    let p2 = ProjectConfig::new("p2", "/p2");
    fx.config.projects = vec![p1.clone(), p2.clone()];
    fx.write("p1/sub/a.txt", "a");
    fx.write("p1/top.txt", "top");
    fx.write("p2/b.txt", "b");
    fx.write("loose/c.txt", "no project");
    fx.run();

    fx.write("p1/sub/c.txt", "c");
    fx.write("p1/new_top.txt", "outside the update");
    fx.write("p2/d.txt", "d");
    let runner = IndexRunner::new(fx.config.clone()).unwrap();
    let report = runner.run_paths(&["/p1/sub", "/loose"]).unwrap();

    assert_eq!(report.projects.len(), 1);
    assert_eq!(report.projects[0].name, "p1");
    assert_eq!(Fixture::stats(&report).added, 1);
    let paths = |p: &ProjectConfig| -> Vec<String> {
        fx.indexed(Some(p)).iter().map(UidKey::path).collect()
    };
    assert_eq!(paths(&p1), vec!["/p1/sub/a.txt", "/p1/sub/c.txt", "/p1/top.txt"]);
    assert_eq!(paths(&p2), vec!["/p2/b.txt"]);
}

#[test]
fn lists_indexed_files_and_frequent_tokens() {
    let fx = Fixture::new();
    for i in 0..17 {
        fx.write(&format!("f{i:02}.txt"), "common_word rare abc");
    }
    fx.write("other.txt", "common_word");
    fx.run();

    let runner = IndexRunner::new(fx.config.clone()).unwrap();
    let files = runner.indexed_files().unwrap();
    assert_eq!(files.len(), 18);
    assert_eq!(files.first().map(String::as_str), Some("/f00.txt"));
    assert_eq!(files.last().map(String::as_str), Some("/other.txt"));
    assert_eq!(runner.indexed_file_count().unwrap(), 18);

    // "rare" is in 17 documents but too short.
    assert_eq!(
        runner.frequent_tokens(FULL_FIELD).unwrap(),
        vec![("common_word".to_string(), 18)]
    );
}
