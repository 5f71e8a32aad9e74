//! Integration tests for vmgate

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn vmgate() -> Command {
        let mut cmd = cargo_bin_cmd!("vmgate");
        cmd.env_remove("VMGATE_IDENTITY").env_remove("VMGATE_LOG");
        cmd
    }

    /// Config file pointing the state store into `temp`
    fn isolated_config(temp: &Path) -> PathBuf {
        let store = temp.join("state");
        let config = temp.join("config.toml");
        std::fs::write(
            &config,
            format!("[store]\ndir = {:?}\n", store.display().to_string()),
        )
        .unwrap();
        config
    }

    fn isolated(temp: &TempDir) -> Command {
        let mut cmd = vmgate();
        cmd.env("VMGATE_CONFIG", isolated_config(temp.path()));
        cmd
    }

    #[test]
    fn help_displays() {
        vmgate()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("per-identity VM lifecycle cache"));
    }

    #[test]
    fn version_displays() {
        vmgate()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("vmgate"));
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        isolated(&temp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        isolated(&temp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[reaper]"))
            .stdout(predicate::str::contains("idle_threshold_minutes = 20"));
    }

    #[test]
    fn config_set_persists() {
        let temp = TempDir::new().unwrap();
        isolated(&temp)
            .args(["config", "set", "reaper.idle_threshold_minutes", "45"])
            .assert()
            .success();

        isolated(&temp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("idle_threshold_minutes = 45"));
    }

    #[test]
    fn config_set_unknown_key() {
        let temp = TempDir::new().unwrap();
        isolated(&temp)
            .args(["config", "set", "reaper.sometimes", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown config key"));
    }

    #[test]
    fn list_empty() {
        let temp = TempDir::new().unwrap();
        isolated(&temp)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No tracked VMs"));
        assert!(temp.path().join("state").is_dir());
    }

    #[test]
    fn list_empty_json() {
        let temp = TempDir::new().unwrap();
        isolated(&temp)
            .args(["list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::starts_with("[]"));
    }

    #[test]
    fn list_shows_recorded_entry() {
        let temp = TempDir::new().unwrap();
        let state = temp.path().join("state");
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join("vm7.addr"), "10.0.0.7\n").unwrap();

        isolated(&temp)
            .args(["list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("vm7"));
    }

    #[test]
    fn evict_invalid_identity() {
        let temp = TempDir::new().unwrap();
        isolated(&temp)
            .args(["evict", "alice"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid identity"));
    }

    #[test]
    fn connect_invalid_identity() {
        let temp = TempDir::new().unwrap();
        isolated(&temp)
            .args(["connect", "--identity", "vm007"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid identity"));
    }

    #[test]
    fn reap_dry_run_conflicts_with_watch() {
        vmgate()
            .args(["reap", "--dry-run", "--watch"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("cannot be used with"));
    }

    #[test]
    fn status_runs() {
        // Reports missing tooling on hosts without qm, but should not panic
        let temp = TempDir::new().unwrap();
        isolated(&temp)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("State store:"));
    }
}
