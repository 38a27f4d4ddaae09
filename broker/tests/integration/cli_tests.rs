//! The helm-broker binary in `--local` mode with a stub helm.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use crate::support::{PLAN_LARGE, PLAN_STANDARD, SERVICE_ID, write_addon};

/// A helm that logs its argv and succeeds.
fn stub_helm(dir: &Path) -> PathBuf {
    let path = dir.join("helm");
    fs::write(&path, "#!/bin/sh\necho \"$*\" >> \"$(dirname \"$0\")/helm.log\"\necho ok\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Env {
    root: TempDir,
    bin: TempDir,
    helm: PathBuf,
}

impl Env {
    fn new() -> Self {
        let root = TempDir::new().expect("tempdir");
        let bin = TempDir::new().expect("tempdir");
        write_addon(root.path());
        let helm = stub_helm(bin.path());
        Self { root, bin, helm }
    }

    fn broker(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("helm-broker"));
        cmd.env("HELMBROKER_CONFIG_ROOT", self.root.path())
            .env("HELMBROKER_HELM_BIN", &self.helm)
            .env("HELMBROKER_KUBECTL_BIN", "/bin/false")
            .env("RUST_LOG", "warn")
            .arg("--local");
        cmd
    }

    fn helm_log(&self) -> String {
        fs::read_to_string(self.bin.path().join("helm.log")).unwrap_or_default()
    }
}

#[test]
fn no_args_shows_help() {
    Command::new(assert_cmd::cargo::cargo_bin!("helm-broker"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn help_lists_lifecycle_commands() {
    Command::new(assert_cmd::cargo::cargo_bin!("helm-broker"))
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("provision"))
        .stdout(predicate::str::contains("deprovision"))
        .stdout(predicate::str::contains("load-catalog"));
}

#[test]
fn local_provision_and_deprovision() {
    let env = Env::new();
    env.broker()
        .arg("load-catalog")
        .assert()
        .success()
        .stdout(predicate::str::contains("Redis"));

    env.broker()
        .args(["provision", "i-1", "--service-id", SERVICE_ID, "--plan-id", PLAN_STANDARD])
        .args(["--context", r#"{"instance_name":"cache-1","namespace":"team-a"}"#])
        .args(["--parameters", r#"{"replicas":3}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""state": "succeeded""#));
    let log = env.helm_log();
    assert!(log.contains("install cache-1"), "{log}");
    assert!(log.contains("replicas=3"), "{log}");

    env.broker()
        .args(["status", "i-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""operation": "provision""#));

    env.broker()
        .args(["deprovision", "i-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""operation": "deprovision""#));
    assert!(env.helm_log().contains("uninstall cache-1"));

    env.broker()
        .arg("clean")
        .assert()
        .success()
        .stdout(predicate::str::contains("i-1"));
    assert!(!env.root.path().join("instances/i-1").exists());
}

#[test]
fn rejected_requests_exit_one() {
    let env = Env::new();
    env.broker()
        .args(["status", "missing"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Error: not found"));

    env.broker()
        .args(["provision", "i-1", "--service-id", SERVICE_ID, "--plan-id", PLAN_STANDARD])
        .args(["--context", r#"{"instance_name":"cache-1","namespace":"team-a"}"#])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("catalog has not been loaded"));
}

#[test]
fn local_update_switches_plan() {
    let env = Env::new();
    env.broker().arg("load-catalog").assert().success();
    env.broker()
        .args(["provision", "i-1", "--service-id", SERVICE_ID, "--plan-id", PLAN_STANDARD])
        .args(["--context", r#"{"instance_name":"cache-1","namespace":"team-a"}"#])
        .assert()
        .success();

    env.broker()
        .args(["update", "i-1", "--plan-id", PLAN_LARGE])
        .args(["--parameters", r#"{"persistence":{"size":"8Gi"}}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""operation": "update""#))
        .stdout(predicate::str::contains(r#""state": "succeeded""#));
    let log = env.helm_log();
    assert!(log.contains("upgrade cache-1"), "{log}");
    assert!(log.contains("persistence.size=8Gi"), "{log}");
    let values = fs::read_to_string(env.root.path().join("instances/i-1/plan/values.yaml")).unwrap();
    assert_eq!(values, "size: large\n");
}

#[test]
fn unreachable_repository_fails_load_catalog() {
    let env = Env::new();
    env.broker()
        .args(["load-catalog", "--repository", "http://127.0.0.1:9/index.yaml"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unavailable"));
    assert!(env.root.path().join("addons/redis-6.0/meta.yaml").exists());
}
