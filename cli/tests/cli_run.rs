// End-to-end test: run the binary on a config directory and check the artifacts
use std::fs;
use std::process::Command;
use tempfile::tempdir;

const LOCAL_TOML: &str = r#"
name = "tiny-local"
seed = 1
num_clients = 4
rounds = 2

[clustering]
method = "local"

[skew]
kind = "iid"

[groups]
num_groups = 2
"#;

const ORACLE_TOML: &str = r#"
name = "tiny-oracle"
seed = 1
num_clients = 4
rounds = 2

[clustering]
method = "threshold"
cutoff = 1.0

[estimator]
kind = "label-overlap"

[skew]
kind = "label-cluster"
samples_per_label = 5

[groups]
num_groups = 2
labels_per_group = 2
"#;

#[test]
fn test_runs_config_directory() {
    let configs = tempdir().unwrap();
    fs::write(configs.path().join("a_local.toml"), LOCAL_TOML).unwrap();
    fs::write(configs.path().join("b_oracle.toml"), ORACLE_TOML).unwrap();
    let results = tempdir().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_fedclust"))
        .arg(configs.path())
        .arg("--results-dir")
        .arg(results.path())
        .args(["--labels", "4", "--train-per-label", "20", "--test-per-label", "10", "--dim", "3"])
        .arg("--show-membership")
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let local_at = stdout.find("== tiny-local").unwrap();
    let oracle_at = stdout.find("== tiny-oracle").unwrap();
    assert!(local_at < oracle_at);

    for name in ["tiny-local", "tiny-oracle"] {
        let summary = fs::read_to_string(results.path().join(format!("{}_summary.csv", name))).unwrap();
        assert_eq!(summary.lines().count(), 3);
    }
    assert!(results.path().join("tiny-oracle_membership_r0.pgm").exists());
}

#[test]
fn test_invalid_config_fails() {
    let configs = tempdir().unwrap();
    let path = configs.path().join("broken.toml");
    fs::write(&path, LOCAL_TOML.replace("rounds = 2", "rounds = 0")).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_fedclust")).arg(&path).output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid configuration"));
}
