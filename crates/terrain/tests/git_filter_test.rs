/// Acceptance tests for the git-filter path, driving the `terrain`
/// binary against a real repository built on the fly. Skipped when git
/// is not installed.
use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

fn terrain_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_terrain"))
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git_in(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// r0: cache + app(v1). r1: new + app(v2). `cache` is removed, `new`
/// added, `app` modified.
fn repo_with_changes() -> TempDir {
    let tmp = TempDir::new().unwrap();
    git_in(tmp.path(), &["init", "--initial-branch=main"]);
    write_file(tmp.path(), "cache/terragrunt.hcl", "# cache v1\n");
    write_file(tmp.path(), "app/terragrunt.hcl", "# app v1\n");
    git_in(tmp.path(), &["add", "."]);
    git_in(tmp.path(), &["commit", "-m", "r0"]);
    git_in(tmp.path(), &["tag", "r0"]);

    git_in(tmp.path(), &["rm", "-r", "cache"]);
    write_file(tmp.path(), "new/terragrunt.hcl", "# new v1\n");
    write_file(tmp.path(), "app/terragrunt.hcl", "# app v2\n");
    git_in(tmp.path(), &["add", "."]);
    git_in(tmp.path(), &["commit", "-m", "r1"]);
    git_in(tmp.path(), &["tag", "r1"]);
    tmp
}

#[test]
fn git_filter_reports_changed_components() {
    if !git_available() {
        return;
    }
    let repo = repo_with_changes();

    let output = terrain_cmd()
        .args([
            "find",
            repo.path().to_str().unwrap(),
            "--filter",
            "[r0...r1]",
            "--command",
            "plan",
            "--format",
            "json",
        ])
        .output()
        .expect("failed to run terrain");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "stdout={stdout} stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let components = value["components"].as_array().unwrap();
    assert_eq!(components.len(), 3, "{stdout}");

    let by_name = |name: &str| -> &serde_json::Value {
        components
            .iter()
            .find(|c| {
                Path::new(c["path"].as_str().unwrap())
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    == name
            })
            .unwrap_or_else(|| panic!("missing component {name}: {stdout}"))
    };

    // The removed unit is backed by r0 and carries the destroy sentinel.
    let cache = by_name("cache");
    assert_eq!(cache["ref_name"], "r0");
    assert!(cache["args"]
        .as_array()
        .unwrap()
        .iter()
        .any(|a| a == "-destroy"));

    for name in ["app", "new"] {
        let component = by_name(name);
        assert_eq!(component["ref_name"], "r1");
        assert!(!component["args"]
            .as_array()
            .unwrap()
            .iter()
            .any(|a| a == "-destroy"));
    }
}

#[test]
fn git_filter_open_range_diffs_against_working_tree() {
    if !git_available() {
        return;
    }
    let repo = repo_with_changes();
    // Uncommitted change on top of r1.
    write_file(repo.path(), "app/terragrunt.hcl", "# app v3, uncommitted\n");

    let output = terrain_cmd()
        .args([
            "find",
            repo.path().to_str().unwrap(),
            "--filter",
            "[r1]",
            "--format",
            "json",
        ])
        .output()
        .expect("failed to run terrain");
    assert!(output.status.success());

    let value: serde_json::Value =
        serde_json::from_str(&String::from_utf8_lossy(&output.stdout)).unwrap();
    let components = value["components"].as_array().unwrap();
    assert_eq!(components.len(), 1);
    assert!(components[0]["path"].as_str().unwrap().ends_with("app"));
    assert_eq!(components[0]["ref_name"], serde_json::Value::Null);
}

#[test]
fn git_filter_rejects_unsupported_command() {
    if !git_available() {
        return;
    }
    let repo = repo_with_changes();

    let output = terrain_cmd()
        .args([
            "find",
            repo.path().to_str().unwrap(),
            "--filter",
            "[r0...r1]",
            "--command",
            "destroy",
        ])
        .output()
        .expect("failed to run terrain");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not supported"), "{stderr}");
}
