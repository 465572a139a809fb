use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use tempfile::{tempdir, TempDir};

struct Sandbox {
    _dir: TempDir,
    home: PathBuf,
    config_dir: PathBuf,
    repo: PathBuf,
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args([
            "-c",
            "user.name=devx",
            "-c",
            "user.email=devx@example.com",
            "-c",
            "commit.gpgsign=false",
            "-c",
            "init.defaultBranch=main",
        ])
        .args(args)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

impl Sandbox {
    /// A repository with a single commit on `main`.
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let home = dir.path().join("home");
        let config_dir = dir.path().join("config");
        let repo = dir.path().join("repo");
        fs::create_dir_all(&home).unwrap();
        fs::create_dir_all(&repo).unwrap();
        let repo = fs::canonicalize(repo).unwrap();
        git(&repo, &["init", "--quiet"]);
        git(&repo, &["checkout", "--quiet", "-B", "main"]);
        fs::write(repo.join("README.md"), "hello\n").unwrap();
        git(&repo, &["add", "README.md"]);
        git(&repo, &["commit", "--quiet", "-m", "init"]);
        Self {
            _dir: dir,
            home,
            config_dir,
            repo,
        }
    }

    fn devx(&self) -> Command {
        self.devx_in(&self.repo)
    }

    fn devx_in(&self, cwd: &Path) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("devx"));
        cmd.current_dir(cwd)
            .env("HOME", &self.home)
            .env("DEVX_CONFIG_DIR", &self.config_dir)
            .env("DEVX_DISABLE_CADDY", "true")
            .env_remove("TMUX")
            .env_remove("VISUAL")
            .env_remove("EDITOR")
            .env_remove("DEVX_LOG");
        cmd
    }

    fn create(&self, name: &str) -> Value {
        let output = self
            .devx()
            .args(["--json", "session", "create", name, "--no-tmux", "--no-editor"])
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "create {name} failed: {}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        parse_json(&output.stdout)
    }

    fn store(&self) -> Value {
        let text = fs::read_to_string(self.config_dir.join("sessions.json")).unwrap();
        serde_json::from_str(&text).unwrap()
    }
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

fn export_value(envrc: &str, var: &str) -> u32 {
    let prefix = format!("export {var}=");
    envrc
        .lines()
        .find_map(|line| line.strip_prefix(&prefix))
        .unwrap_or_else(|| panic!("{var} missing from .envrc"))
        .parse()
        .unwrap()
}

#[test]
fn create_provisions_worktree_envrc_and_record() {
    let sb = Sandbox::new();
    let payload = sb.create("feat-foo");
    assert_eq!(payload["ok"], true);

    let workspace = sb.repo.join(".worktrees").join("feat-foo");
    assert!(workspace.is_dir());
    assert_eq!(
        git(&workspace, &["rev-parse", "--abbrev-ref", "HEAD"]),
        "feat-foo"
    );

    let envrc = fs::read_to_string(workspace.join(".envrc")).unwrap();
    let ui = export_value(&envrc, "UI_PORT");
    let api = export_value(&envrc, "API_PORT");
    assert_ne!(ui, api);
    for port in [ui, api] {
        assert!((1024..=65535).contains(&port));
    }
    assert!(envrc.contains("export SESSION_NAME=feat-foo"));
    assert!(workspace.join(".tmuxp.yaml").is_file());

    let record = &sb.store()["sessions"]["feat-foo"];
    assert_eq!(record["branch"], "feat-foo");
    let path = PathBuf::from(record["path"].as_str().unwrap());
    assert!(path.is_absolute());
    assert_eq!(path, workspace);

    let exclude = fs::read_to_string(sb.repo.join(".git").join("info").join("exclude")).unwrap();
    assert!(exclude.lines().any(|line| line == "/.worktrees/"));
    assert!(git(&sb.repo, &["status", "--porcelain"]).is_empty());
}

#[test]
fn duplicate_create_is_rejected() {
    let sb = Sandbox::new();
    sb.create("feat-bar");
    sb.devx()
        .args(["session", "create", "feat-bar", "--no-tmux", "--no-editor"])
        .assert()
        .failure()
        .stderr(contains("session 'feat-bar' already exists"));
    let sessions = sb.store()["sessions"].as_object().unwrap().clone();
    assert_eq!(sessions.len(), 1);
}

#[test]
fn explicit_ports_are_honored() {
    let sb = Sandbox::new();
    let payload = {
        let output = sb
            .devx()
            .args([
                "--json", "session", "create", "ports", "--fe-port", "43123", "--port",
                "db=43124", "--no-tmux", "--no-editor",
            ])
            .output()
            .unwrap();
        assert!(output.status.success());
        parse_json(&output.stdout)
    };
    let ports = &payload["result"]["ports"];
    assert_eq!(ports["ui"], 43123);
    assert_eq!(ports["db"], 43124);
    assert!(ports["api"].as_u64().is_some());
}

#[test]
fn remove_unknown_session_fails_without_touching_store() {
    let sb = Sandbox::new();
    sb.create("keep");
    let before = fs::read_to_string(sb.config_dir.join("sessions.json")).unwrap();
    sb.devx()
        .args(["session", "rm", "ghost", "--force"])
        .assert()
        .failure()
        .stderr(contains("session 'ghost' not found"));
    let after = fs::read_to_string(sb.config_dir.join("sessions.json")).unwrap();
    assert_eq!(before, after);
}

#[test]
fn remove_deletes_worktree_and_record() {
    let sb = Sandbox::new();
    sb.create("short-lived");
    let workspace = sb.repo.join(".worktrees").join("short-lived");
    assert!(workspace.is_dir());

    sb.devx()
        .args(["session", "rm", "short-lived", "--force"])
        .assert()
        .success()
        .stdout(contains("removed session 'short-lived'"));
    assert!(!workspace.exists());
    assert!(sb.store()["sessions"].as_object().unwrap().is_empty());
    assert!(!git(&sb.repo, &["worktree", "list"]).contains("short-lived"));
}

#[test]
fn attach_clears_attention_flag() {
    let sb = Sandbox::new();
    sb.create("s1");
    sb.devx()
        .args(["session", "flag", "s1", "review me"])
        .assert()
        .success();
    let record = &sb.store()["sessions"]["s1"];
    assert_eq!(record["attention_flag"], true);
    assert_eq!(record["attention_reason"], "review me");

    let output = sb
        .devx()
        .args(["--json", "session", "attach", "s1", "--no-tmux", "--no-editor"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let first = parse_json(&output.stdout)["result"]["last_attached"].clone();
    let record = &sb.store()["sessions"]["s1"];
    assert!(record.get("attention_flag").is_none());
    assert!(record["last_attached"].is_string());
    assert_eq!(record["last_attached"], first);
}

#[test]
fn flag_refuses_current_session_without_force() {
    let sb = Sandbox::new();
    sb.create("here");
    let workspace = sb.repo.join(".worktrees").join("here");
    sb.devx_in(&workspace)
        .args(["session", "flag", "here"])
        .assert()
        .failure()
        .stderr(contains("current session"));
    sb.devx_in(&workspace)
        .args(["session", "flag", "here", "--force"])
        .assert()
        .success();
    sb.devx()
        .args(["session", "flag", "here", "--clear"])
        .assert()
        .success()
        .stdout(contains("cleared flag"));
}

#[test]
fn list_shows_sessions_as_table_and_json() {
    let sb = Sandbox::new();
    sb.create("alpha");
    sb.create("beta");

    sb.devx()
        .args(["session", "list"])
        .assert()
        .success()
        .stdout(contains("NAME"))
        .stdout(contains("alpha"))
        .stdout(contains("beta"));

    let output = sb.devx().args(["--json", "session", "list"]).output().unwrap();
    assert!(output.status.success());
    let payload = parse_json(&output.stdout);
    let names: Vec<&str> = payload["result"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    assert_eq!(payload["result"][0]["tmux_live"], false);
}

#[test]
fn invalid_session_name_reports_validation_kind() {
    let sb = Sandbox::new();
    let output = sb
        .devx()
        .args(["--json", "session", "create", "foo.lock", "--no-tmux", "--no-editor"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let payload = parse_json(&output.stdout);
    assert_eq!(payload["ok"], false);
    assert_eq!(payload["error_kind"], "validation");
    assert!(!sb.repo.join(".worktrees").exists());
}

#[test]
fn config_init_get_set() {
    let sb = Sandbox::new();
    sb.devx()
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(contains("wrote"));
    assert!(sb.config_dir.join("config.yaml").is_file());
    sb.devx()
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(contains("already exists"));

    sb.devx()
        .args(["config", "set", "editor", "nvim"])
        .assert()
        .success();
    sb.devx()
        .args(["config", "get", "editor"])
        .assert()
        .success()
        .stdout("nvim\n");

    sb.devx()
        .args(["config", "set", "ports", "[web, worker]"])
        .assert()
        .success();
    let output = sb
        .devx()
        .args(["--json", "config", "get", "ports"])
        .output()
        .unwrap();
    let payload = parse_json(&output.stdout);
    assert_eq!(payload["result"]["value"], serde_json::json!(["web", "worker"]));

    sb.devx()
        .args(["config", "set", "host_scheme", "gopher"])
        .assert()
        .failure();
    sb.devx()
        .args(["config", "get", "nope"])
        .assert()
        .failure()
        .stderr(contains("unknown config key"));
}

#[test]
fn project_config_overrides_ports() {
    let sb = Sandbox::new();
    sb.devx()
        .args(["config", "init", "--project"])
        .assert()
        .success();
    assert!(sb.repo.join(".devx").join("config.yaml").is_file());
    sb.devx()
        .args(["config", "set", "ports", "[web]"])
        .assert()
        .success();

    let payload = sb.create("proj");
    let ports = payload["result"]["ports"].as_object().unwrap();
    assert_eq!(ports.keys().collect::<Vec<_>>(), vec!["web"]);
    // The store lives next to the project config.
    assert!(sb.repo.join(".devx").join("sessions.json").is_file());
}

#[test]
fn project_registry_round_trip() {
    let sb = Sandbox::new();
    let elsewhere = sb.home.clone();
    sb.devx_in(&elsewhere)
        .args([
            "project",
            "add",
            sb.repo.to_str().unwrap(),
            "--alias",
            "app",
            "--description",
            "demo app",
        ])
        .assert()
        .success();

    sb.devx_in(&elsewhere)
        .args(["project", "list"])
        .assert()
        .success()
        .stdout(contains("app"))
        .stdout(contains("demo app"));

    // Sessions can be created from outside the repository by alias.
    let output = sb
        .devx_in(&elsewhere)
        .args([
            "--json", "session", "create", "remote", "--project", "app", "--no-tmux",
            "--no-editor",
        ])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(parse_json(&output.stdout)["result"]["project_alias"], "app");
    assert!(sb.repo.join(".worktrees").join("remote").is_dir());

    sb.devx_in(&elsewhere)
        .args(["project", "add", sb.home.to_str().unwrap(), "--alias", "home"])
        .assert()
        .failure()
        .stderr(contains("not the root of a git repository"));
    sb.devx_in(&elsewhere)
        .args(["project", "rm", "app"])
        .assert()
        .success();
    sb.devx_in(&elsewhere)
        .args(["project", "rm", "app"])
        .assert()
        .failure()
        .stderr(contains("not found"));
}

#[test]
fn check_reports_git() {
    let sb = Sandbox::new();
    let output = sb.devx().args(["--json", "check"]).output().unwrap();
    assert!(output.status.success());
    let payload = parse_json(&output.stdout);
    let checks = payload["result"]["checks"].as_array().unwrap();
    let git = checks.iter().find(|c| c["id"] == "git").unwrap();
    assert_eq!(git["ok"], true);
    assert!(checks.iter().any(|c| c["id"] == "caddy"));
}

#[test]
fn version_outputs() {
    let sb = Sandbox::new();
    sb.devx()
        .arg("version")
        .assert()
        .success()
        .stdout(contains(format!("devx {}", env!("CARGO_PKG_VERSION"))));

    let output = sb
        .devx()
        .args(["version", "--output", "json", "--detailed"])
        .output()
        .unwrap();
    let payload = parse_json(&output.stdout);
    assert_eq!(payload["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(payload["os"], std::env::consts::OS);
    assert!(payload["global_dir"]
        .as_str()
        .unwrap()
        .ends_with("config"));
}

#[test]
fn caddy_check_respects_disable_switch() {
    let sb = Sandbox::new();
    sb.devx()
        .args(["caddy", "check"])
        .assert()
        .success()
        .stdout(contains("disabled"));
}

#[test]
fn clear_removes_all_sessions() {
    let sb = Sandbox::new();
    sb.create("one");
    sb.create("two");
    sb.devx()
        .args(["session", "clear", "--force"])
        .assert()
        .success()
        .stdout(contains("removed 2 session(s)"));
    assert!(sb.store()["sessions"].as_object().unwrap().is_empty());
    assert!(!sb.repo.join(".worktrees").exists());
}
