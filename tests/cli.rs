use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harvest");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let inputs = root.join("inputs");
    fs::create_dir_all(&inputs).unwrap();
    let mut csv = String::from("date,category,orders,region\n");
    for i in 1..=40 {
        let orders = if i == 17 { 500 } else { 50 + (i % 5) };
        let region = if i % 2 == 0 { "emea" } else { "amer" };
        csv.push_str(&format!("2026-02-{:02},returns,{},{}\n", (i % 28) + 1, orders, region));
    }
    fs::write(inputs.join("orders.csv"), csv).unwrap();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_content = format!(
        r#"[pipeline]
output = "{root}/data/events.json"

[[pipeline.sources]]
key = "orders"
domain = "product"
path = "{root}/inputs/orders.csv"
"#,
        root = root.display()
    );
    let config_path = config_dir.join("harvest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_harvest(config_path: Option<&Path>, args: &[&str]) -> (String, String, bool) {
    let binary = harvest_binary();
    let mut cmd = Command::new(&binary);
    if let Some(cfg) = config_path {
        cmd.arg("--config").arg(cfg);
    }
    let output = cmd
        .args(args)
        .env_remove("OPENAI_API_KEY")
        .env_remove("SUPABASE_URL")
        .env_remove("SUPABASE_SERVICE_ROLE_KEY")
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_digest_prints_facts_sheet() {
    let (tmp, _config) = setup_test_env();
    let csv = tmp.path().join("inputs/orders.csv");

    let (stdout, stderr, success) =
        run_harvest(None, &["digest", csv.to_str().unwrap(), "--domain", "product"]);
    assert!(success, "digest failed: {}", stderr);

    let digest: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(digest["type"], "tabular_dataset_facts_sheet");
    assert_eq!(digest["row_count"], 40);
    assert_eq!(digest["schema"]["mapped"]["volume"], "orders");
    let sheet = digest["facts_sheet"].as_str().unwrap();
    assert!(sheet.starts_with("# Facts Sheet: orders"));
    assert!(sheet.contains("- spike row=17"), "sheet:\n{}", sheet);
    assert!(sheet.lines().count() <= 200);
}

#[test]
fn test_digest_type_hint_overrides_extension() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("alerts.log");
    fs::write(
        &path,
        r#"[{"severity":"critical","service":"api","region":"eu","timestamp":"2026-03-01T00:00:00Z"}]"#,
    )
    .unwrap();

    let (stdout, stderr, success) = run_harvest(
        None,
        &["digest", path.to_str().unwrap(), "--type", "json", "--key", "alerts"],
    );
    assert!(success, "digest failed: {}", stderr);
    let digest: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(digest["type"], "ops_it_alert_stream");
    assert_eq!(digest["analytics"]["item_count"], 1);
}

#[test]
fn test_digest_rejects_unknown_extension() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("slides.pptx");
    fs::write(&path, b"x").unwrap();

    let (_stdout, stderr, success) = run_harvest(None, &["digest", path.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("unsupported input type"), "stderr: {}", stderr);
}

#[test]
fn test_generate_events_requires_api_key() {
    let (tmp, config) = setup_test_env();

    let (_stdout, stderr, success) = run_harvest(Some(&config), &["generate-events"]);
    assert!(!success);
    assert!(stderr.starts_with("Error:"), "stderr: {}", stderr);
    assert!(stderr.contains("OPENAI_API_KEY"), "stderr: {}", stderr);
    assert!(!tmp.path().join("data/events.json").exists());
}

#[test]
fn test_push_events_requires_supabase_settings() {
    let (_tmp, config) = setup_test_env();

    let (_stdout, stderr, success) = run_harvest(Some(&config), &["push-events"]);
    assert!(!success);
    assert!(stderr.contains("SUPABASE_URL"), "stderr: {}", stderr);
}

#[test]
fn test_explicit_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");

    let (_stdout, stderr, success) = run_harvest(Some(&missing), &["generate-events"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr: {}", stderr);
}

#[test]
fn test_sync_without_drive_section_fails() {
    let (_tmp, config) = setup_test_env();

    let (_stdout, stderr, success) = run_harvest(Some(&config), &["sync"]);
    assert!(!success);
    assert!(stderr.contains("[drive]"), "stderr: {}", stderr);
}
