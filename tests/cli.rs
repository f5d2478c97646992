use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use tempfile::TempDir;

fn pq_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("pq");
    path
}

fn schema_docs() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("config/schema_docs.json")
}

fn write_config(root: &Path, extra: &str) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/patents.db"

[catalog]
schema_docs = "{}"

[embedding]
provider = "hashing"
dims = 256

[llm]
provider = "disabled"

[logging]
level = "warn"
{}
"#,
        root.display(),
        schema_docs().display(),
        extra
    );

    let config_path = config_dir.join("pq.toml");
    fs::write(&config_path, config_content).unwrap();
    config_path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "");
    (tmp, config_path)
}

fn run_pq(config_path: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    let binary = pq_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run pq binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

#[test]
fn test_tables_lists_catalog() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_pq(&config_path, &["tables"]);
    assert_eq!(code, Some(0), "tables failed: {}", stderr);
    assert_eq!(stdout.lines().count(), 21);
    assert!(stdout.lines().next().unwrap().starts_with("patents"));
    assert!(stdout.contains("claims"));
    assert!(stdout.contains("error_logs"));
}

#[test]
fn test_check_reports_catalog_and_missing_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_pq(&config_path, &["check"]);
    assert_eq!(code, Some(0), "check failed: {}", stderr);
    assert!(stdout.contains("catalog: 21 tables"));
    assert!(stdout.contains("20 foreign keys"));
    assert!(stdout.contains("index: 21 entries"));
    assert!(stdout.contains("database: unavailable"));
    assert!(stdout.contains("llm: disabled"));
}

#[test]
fn test_column_granularity_indexes_every_column() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "\n[retrieval]\ngranularity = \"column\"\n");

    let (stdout, stderr, code) = run_pq(&config_path, &["check"]);
    assert_eq!(code, Some(0), "check failed: {}", stderr);
    let entries: usize = stdout
        .lines()
        .find_map(|l| l.strip_prefix("index: "))
        .and_then(|l| l.split_whitespace().next())
        .and_then(|n| n.parse().ok())
        .unwrap();
    assert!(entries > 21);
}

#[test]
fn test_search_ranks_claims_first() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_pq(&config_path, &["search", "claims", "--k", "2"]);
    assert_eq!(code, Some(0), "search failed: {}", stderr);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("1. claims "));
}

#[test]
fn test_search_is_deterministic() {
    let (_tmp, config_path) = setup_test_env();

    let (first, _, _) = run_pq(&config_path, &["search", "who invented the widget", "--k", "5"]);
    let (second, _, _) = run_pq(&config_path, &["search", "who invented the widget", "--k", "5"]);
    assert_eq!(first, second);
    assert_eq!(first.lines().count(), 5);
}

#[test]
fn test_context_includes_join_partner() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_pq(
        &config_path,
        &["context", "How many total claims does each patent have?"],
    );
    assert_eq!(code, Some(0), "context failed: {}", stderr);
    assert!(stdout.contains("TABLE claims"));
    assert!(stdout.contains("TABLE patents"));
    assert!(stdout.contains("REFERENCES patents(patent_id)"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "\n[retrieval]\nmax_context_tables = 0\n");

    let (_, stderr, code) = run_pq(&config_path, &["tables"]);
    assert_ne!(code, Some(0));
    assert!(stderr.contains("max_context_tables"));
}

#[tokio::test]
async fn test_ask_without_model_reports_failure() {
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    let (tmp, config_path) = setup_test_env();
    let data_dir = tmp.path().join("data");
    fs::create_dir_all(&data_dir).unwrap();

    let options =
        SqliteConnectOptions::from_str(&format!("sqlite:{}", data_dir.join("patents.db").display()))
            .unwrap()
            .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE patents (patent_id TEXT PRIMARY KEY, title TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let (stdout, stderr, code) = run_pq(&config_path, &["ask", "How many patents?", "--json"]);
    assert_eq!(code, Some(2), "stdout={} stderr={}", stdout, stderr);

    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(result["status"], "execution-error-fatal");
    assert_eq!(result["attempts"].as_array().unwrap().len(), 1);
    assert_eq!(result["attempts"][0]["outcome"]["kind"], "model-unavailable");
    assert!(result["answer"]
        .as_str()
        .unwrap()
        .contains("could not be answered"));
}
