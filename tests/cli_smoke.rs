use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

fn taxonomy(args: &[&str], cwd: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_taxonomy"))
        .args(args)
        .current_dir(cwd)
        .env_remove("TAXONOMY_API_KEY")
        .env_remove("TAXONOMY_STORE_PATH")
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run taxonomy binary")
}

#[test]
fn help_lists_subcommands() {
    let dir = tempdir().unwrap();
    let out = taxonomy(&["--help"], dir.path());
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    for cmd in ["sample", "consolidate", "analyze", "run", "registry", "export"] {
        assert!(text.contains(cmd), "missing {cmd} in help");
    }
}

#[test]
fn registry_seed_stats_and_export() {
    let dir = tempdir().unwrap();
    let vocab = dir.path().join("seed.json");
    std::fs::write(
        &vocab,
        r#"{
            "input_structure": ["array", {"name": "tree", "description": "rooted acyclic graph"}],
            "objective": ["count"]
        }"#,
    )
    .unwrap();

    let out = taxonomy(&["registry", "seed", "--vocab", "seed.json"], dir.path());
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains("seeded 3 labels"));

    // Seeding twice adds nothing.
    let out = taxonomy(&["registry", "seed", "--vocab", "seed.json"], dir.path());
    assert!(String::from_utf8_lossy(&out.stdout).contains("seeded 0 labels"));

    let out = taxonomy(&["registry", "stats"], dir.path());
    assert!(out.status.success());
    let stats = String::from_utf8_lossy(&out.stdout);
    assert!(stats.lines().any(|l| l.starts_with("input_structure") && l.contains("2 labels")));

    let out = taxonomy(&["registry", "export", "--out", "snapshot.json"], dir.path());
    assert!(out.status.success());
    let snapshot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("snapshot.json")).unwrap()).unwrap();
    assert_eq!(
        snapshot["input_structure"]["tree"]["description"],
        "rooted acyclic graph"
    );
    assert!(dir.path().join("registry").join("objective.json").exists());
}

#[test]
fn analyze_empty_store_reports_insufficient_data() {
    let dir = tempdir().unwrap();
    let out = taxonomy(
        &["analyze", "--store", "t.sqlite", "--out", "report.json", "--curve-csv", "curve.csv"],
        dir.path(),
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("report.json")).unwrap()).unwrap();
    assert_eq!(report["items"], 0);
    assert_eq!(report["verdicts"]["objective"], "INSUFFICIENT_DATA");
    let csv = std::fs::read_to_string(dir.path().join("curve.csv")).unwrap();
    assert_eq!(csv, "dimension,item_index,cumulative_labels\n");
}

#[test]
fn sampling_without_credentials_fails() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("items.json"),
        r#"[{"id": "p1", "title": "Two sum"}]"#,
    )
    .unwrap();
    let out = taxonomy(&["sample", "--items", "items.json", "--store", "t.sqlite"], dir.path());
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("TAXONOMY_API_KEY"));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("bad.toml"),
        "[saturation.thresholds]\nfinite_r_squared = 0.5\n",
    )
    .unwrap();
    let out = taxonomy(&["analyze", "--store", "t.sqlite", "--config", "bad.toml"], dir.path());
    assert!(!out.status.success());
}
