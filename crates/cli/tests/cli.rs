use assert_cmd::Command;
use std::fs;
use tempfile::TempDir;

fn treegrok() -> Command {
    Command::cargo_bin("treegrok").unwrap()
}

#[test]
fn json_report_lists_added_files() {
    let src = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    fs::write(src.path().join("a.txt"), "alpha").unwrap();
    fs::write(src.path().join("b.rs"), "fn b() {}").unwrap();

    let output = treegrok()
        .arg("--source-root")
        .arg(src.path())
        .arg("--data-root")
        .arg(data.path())
        .args(["-j", "1", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["projects"][0]["stats"]["added"], 2);
    assert_eq!(report["completed"], 2);
    assert!(data.path().join("xref").join("a.txt").exists());
}

#[test]
fn missing_source_root_fails() {
    let data = TempDir::new().unwrap();
    treegrok()
        .arg("--source-root")
        .arg(data.path().join("nope"))
        .arg("--data-root")
        .arg(data.path())
        .assert()
        .failure();
}

#[test]
fn failed_project_sets_exit_code() {
    let src = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    treegrok()
        .arg("--source-root")
        .arg(src.path())
        .arg("--data-root")
        .arg(data.path())
        .args(["--project", "ghost=/ghost"])
        .assert()
        .failure();
}

#[test]
fn partial_update_and_file_listing() {
    let src = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    fs::create_dir_all(src.path().join("a")).unwrap();
    fs::write(src.path().join("a/one.txt"), "one").unwrap();
    fs::write(src.path().join("top.txt"), "top").unwrap();

    treegrok()
        .arg("--source-root")
        .arg(src.path())
        .arg("--data-root")
        .arg(data.path())
        .arg("/a")
        .assert()
        .success();

    let output = treegrok()
        .arg("--source-root")
        .arg(src.path())
        .arg("--data-root")
        .arg(data.path())
        .arg("--list-files")
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().collect::<Vec<_>>(), vec!["/a/one.txt", "1 file(s)"]);
}
