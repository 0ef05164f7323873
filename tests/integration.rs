use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/docchat.sqlite"

[storage]
data_dir = "{root}/data/files"
converted_dir = "{root}/data/converted_files"
public_base_url = "http://docs.example.test"

[chunking]
max_tokens = 250
overlap_tokens = 50

[server]
bind = "127.0.0.1:7341"

[logging]
query_log = "{root}/data/query_log.log"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("docchat.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docchat(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_docchat"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("DOCCHAT_LOG")
        .output()
        .expect("Failed to run docchat binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database_and_dirs() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docchat(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/docchat.sqlite").is_file());
    assert!(tmp.path().join("data/files").is_dir());
    assert!(tmp.path().join("data/converted_files").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_docchat(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_docchat(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_docchat(&tmp.path().join("absent.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("config"), "stderr={}", stderr);
}

#[test]
fn test_convert_writes_text_copies() {
    let (tmp, config_path) = setup_test_env();
    let reports = tmp.path().join("data/files/reports");
    fs::create_dir_all(&reports).unwrap();
    fs::write(reports.join("ports.csv"), "name,depth\nnorth,12\nsouth,9\n").unwrap();
    fs::write(reports.join("notes.txt"), "plain text needs no conversion").unwrap();
    fs::write(reports.join("broken.docx"), "not a zip archive").unwrap();

    let (stdout, stderr, success) = run_docchat(&config_path, &["convert"]);
    assert!(success, "convert failed: stdout={}, stderr={}", stdout, stderr);
    assert!(
        stdout.contains("Converted 1 file(s), skipped 1, failed 1."),
        "got: {}",
        stdout
    );

    let text = fs::read_to_string(tmp.path().join("data/converted_files/ports.txt")).unwrap();
    assert!(text.contains("north,12"));
    assert!(text.contains("south,9"));
}

#[test]
fn test_folders_lists_top_level_dirs() {
    let (tmp, config_path) = setup_test_env();
    let files = tmp.path().join("data/files");
    fs::create_dir_all(files.join("manuals")).unwrap();
    fs::create_dir_all(files.join("contracts")).unwrap();
    fs::write(files.join("loose.txt"), "x").unwrap();

    let (stdout, _, success) = run_docchat(&config_path, &["folders"]);
    assert!(success);
    let folders: Vec<&str> = stdout.lines().collect();
    assert_eq!(folders, vec!["contracts", "manuals"]);
}

#[test]
fn test_files_lists_static_urls() {
    let (tmp, config_path) = setup_test_env();
    let files = tmp.path().join("data/files");
    fs::create_dir_all(files.join("manuals")).unwrap();

    let (stdout, _, success) = run_docchat(&config_path, &["files"]);
    assert!(success);
    assert!(stdout.contains("No files found"));

    fs::write(files.join("manuals/pump guide.docx"), "x").unwrap();
    let (stdout, _, success) = run_docchat(&config_path, &["files"]);
    assert!(success);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let entry = &json["manuals"][0];
    assert_eq!(entry["file"], "pump guide.docx");
    assert_eq!(
        entry["converted_url"],
        "http://docs.example.test/files/pump guide.txt"
    );
}

#[test]
fn test_ingest_rejects_unknown_embeddings() {
    let (tmp, config_path) = setup_test_env();
    let corpus = tmp.path().join("corpus");
    fs::create_dir_all(&corpus).unwrap();
    fs::write(corpus.join("a.txt"), "Harbour hours.").unwrap();

    let (_, stderr, success) = run_docchat(
        &config_path,
        &[
            "ingest",
            corpus.to_str().unwrap(),
            "--embeddings",
            "word2vec",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("word2vec"), "stderr={}", stderr);
}
