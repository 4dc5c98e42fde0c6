use predicates::prelude::PredicateBooleanExt;

fn setup_tree() -> tempfile::TempDir {
    // src
    // |- a (10 bytes)
    // |- b
    //    |- c (20 bytes)
    //    |- d (30 bytes)
    let tmp_dir = tempfile::tempdir().unwrap();
    let src = tmp_dir.path().join("src");
    std::fs::create_dir_all(src.join("b")).unwrap();
    std::fs::write(src.join("a"), "a".repeat(10)).unwrap();
    std::fs::write(src.join("b").join("c"), "c".repeat(20)).unwrap();
    std::fs::write(src.join("b").join("d"), "d".repeat(30)).unwrap();
    tmp_dir
}

fn ferry() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("ferry").unwrap()
}

fn path_arg(path: &std::path::Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_copy_tree() {
    let tmp_dir = setup_tree();
    let src = tmp_dir.path().join("src");
    let dst = tmp_dir.path().join("dst");
    ferry()
        .args(["-j", "2", path_arg(&src), path_arg(&dst)])
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(dst.join("a")).unwrap(), "a".repeat(10));
    assert_eq!(
        std::fs::read_to_string(dst.join("b").join("c")).unwrap(),
        "c".repeat(20)
    );
    assert_eq!(
        std::fs::read_to_string(dst.join("b").join("d")).unwrap(),
        "d".repeat(30)
    );
}

#[test]
fn test_summary_output() {
    let tmp_dir = setup_tree();
    let src = tmp_dir.path().join("src");
    let dst = tmp_dir.path().join("dst");
    ferry()
        .args(["--summary", path_arg(&src), path_arg(&dst)])
        .assert()
        .success()
        .stdout(predicates::str::contains("files transferred: 3"))
        .stdout(predicates::str::contains("directories created: 2"));
}

#[test]
fn test_json_summary() {
    let tmp_dir = setup_tree();
    let src = tmp_dir.path().join("src");
    let dst = tmp_dir.path().join("dst");
    let output = ferry()
        .args(["--json", "--read-size", "8", path_arg(&src), path_arg(&dst)])
        .output()
        .unwrap();
    assert!(output.status.success());
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["bytes_transferred"], 60);
    assert_eq!(summary["files_transferred"], 3);
    assert_eq!(summary["errors"], 0);
}

#[test]
fn test_copy_single_file_into_directory() {
    let tmp_dir = setup_tree();
    let src = tmp_dir.path().join("src").join("a");
    let into = tmp_dir.path().join("into");
    std::fs::create_dir(&into).unwrap();
    ferry()
        .args([path_arg(&src), &format!("{}/", path_arg(&into))])
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(into.join("a")).unwrap(), "a".repeat(10));
}

#[test]
fn test_existing_file_requires_overwrite() {
    let tmp_dir = setup_tree();
    let src = tmp_dir.path().join("src").join("a");
    let dst = tmp_dir.path().join("existing");
    std::fs::write(&dst, "old content").unwrap();
    ferry()
        .args([path_arg(&src), path_arg(&dst)])
        .assert()
        .failure()
        .stderr(predicates::str::contains("--overwrite"));
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "old content");
    ferry()
        .args(["--overwrite", path_arg(&src), path_arg(&dst)])
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "a".repeat(10));
}

#[test]
fn test_existing_directory_requires_overwrite() {
    let tmp_dir = setup_tree();
    let src = tmp_dir.path().join("src");
    let dst = tmp_dir.path().join("dst");
    std::fs::create_dir_all(dst.join("b")).unwrap();
    ferry()
        .args([path_arg(&src), path_arg(&dst)])
        .assert()
        .failure()
        .stderr(predicates::str::contains("already exists"));
    ferry()
        .args(["--overwrite", "--summary", path_arg(&src), path_arg(&dst)])
        .assert()
        .success()
        .stdout(predicates::str::contains("directories reused: 2"));
    assert_eq!(
        std::fs::read_to_string(dst.join("b").join("d")).unwrap(),
        "d".repeat(30)
    );
}

#[test]
fn test_wildcard_source() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let src = tmp_dir.path().join("logs");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("one.log"), "1").unwrap();
    std::fs::write(src.join("two.log"), "2").unwrap();
    std::fs::write(src.join("notes.txt"), "skip").unwrap();
    let dst = tmp_dir.path().join("backup");
    ferry()
        .args([&format!("{}/*.log", path_arg(&src)), path_arg(&dst)])
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(dst.join("one.log")).unwrap(), "1");
    assert_eq!(std::fs::read_to_string(dst.join("two.log")).unwrap(), "2");
    assert!(!dst.join("notes.txt").exists());
}

#[test]
fn test_missing_source_fails() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let src = tmp_dir.path().join("missing");
    let dst = tmp_dir.path().join("dst");
    ferry()
        .args([path_arg(&src), path_arg(&dst)])
        .assert()
        .failure()
        .stderr(predicates::str::contains("not found"));
    assert!(!dst.exists());
}

#[test]
fn test_quiet_suppresses_errors() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let src = tmp_dir.path().join("missing");
    let dst = tmp_dir.path().join("dst");
    ferry()
        .args(["--quiet", path_arg(&src), path_arg(&dst)])
        .assert()
        .failure()
        .stderr(predicates::str::is_empty());
}

#[test]
fn test_failure_summary_is_printed() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let src = tmp_dir.path().join("missing");
    let dst = tmp_dir.path().join("dst");
    ferry()
        .args(["--summary", path_arg(&src), path_arg(&dst)])
        .assert()
        .failure()
        .stderr(predicates::str::contains("errors: 1"));
}

#[test]
fn test_iops_throttle_requires_chunk_size() {
    let tmp_dir = setup_tree();
    let src = tmp_dir.path().join("src");
    let dst = tmp_dir.path().join("dst");
    ferry()
        .args(["--iops-throttle", "10", path_arg(&src), path_arg(&dst)])
        .assert()
        .failure()
        .stderr(predicates::str::contains("chunk_size"));
    assert!(!dst.exists());
}

#[test]
fn test_throttled_copy() {
    let tmp_dir = setup_tree();
    let src = tmp_dir.path().join("src");
    let dst = tmp_dir.path().join("dst");
    ferry()
        .args([
            "--max-open-files",
            "2",
            "--ops-throttle",
            "1000",
            "--iops-throttle",
            "1000",
            "--chunk-size",
            "16",
            path_arg(&src),
            path_arg(&dst),
        ])
        .assert()
        .success()
        .stderr(predicates::str::contains("ERROR").not());
    assert_eq!(
        std::fs::read_to_string(dst.join("b").join("d")).unwrap(),
        "d".repeat(30)
    );
}

#[test]
fn test_text_progress() {
    let tmp_dir = setup_tree();
    let src = tmp_dir.path().join("src");
    let dst = tmp_dir.path().join("dst");
    ferry()
        .args([
            "--progress-type",
            "text-updates",
            "--progress-delay",
            "10ms",
            path_arg(&src),
            path_arg(&dst),
        ])
        .assert()
        .success();
    assert!(dst.join("a").exists());
}
