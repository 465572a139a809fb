//! Git worktree provisioning for session workspaces.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DevxError, Result};
use crate::runner::{command_failed, spawn_error, CommandOutput, RunOptions, ToolRunner};

pub const WORKTREES_DIR: &str = ".worktrees";
const EXCLUDE_ENTRY: &str = "/.worktrees/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
}

pub fn workspace_path(project: &Path, name: &str) -> PathBuf {
    project.join(WORKTREES_DIR).join(name)
}

/// Parses `git worktree list --porcelain`.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path.trim()),
                branch: None,
                head: None,
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                entry.head = Some(head.trim().to_string());
            } else if let Some(branch) = line.strip_prefix("branch ") {
                let branch = branch.trim();
                entry.branch = Some(
                    branch
                        .strip_prefix("refs/heads/")
                        .unwrap_or(branch)
                        .to_string(),
                );
            }
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

fn same_path(a: &Path, b: &Path) -> bool {
    let a = fs::canonicalize(a).unwrap_or_else(|_| a.to_path_buf());
    let b = fs::canonicalize(b).unwrap_or_else(|_| b.to_path_buf());
    a == b
}

fn classify_add_failure(stderr: &str) -> Option<&'static str> {
    let lower = stderr.to_lowercase();
    if lower.contains("already checked out") || lower.contains("already used by worktree") {
        return Some("branch_in_use");
    }
    if lower.contains("already exists") {
        return Some("worktree_conflict");
    }
    None
}

/// Remote problems that a pre-create refresh tolerates.
fn is_tolerated_pull_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    [
        "no such remote",
        "does not appear to be a git repository",
        "couldn't find remote ref",
        "no tracking information",
        "not possible to fast-forward",
        "diverging branches",
        "non-fast-forward",
        "rejected",
        "could not read from remote repository",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

pub struct Git<'a> {
    runner: &'a dyn ToolRunner,
}

impl<'a> Git<'a> {
    pub fn new(runner: &'a dyn ToolRunner) -> Self {
        Self { runner }
    }

    fn git(&self, repo: &Path, args: &[&str]) -> Result<(Vec<String>, CommandOutput)> {
        let mut full = vec!["-C".to_string(), repo.display().to_string()];
        full.extend(args.iter().map(|a| a.to_string()));
        let output = self
            .runner
            .run("git", &full, &RunOptions::default())
            .map_err(|err| spawn_error("git", &full, &err))?;
        Ok((full, output))
    }

    fn git_ok(&self, repo: &Path, args: &[&str], error_code: &str) -> Result<String> {
        let (full, output) = self.git(repo, args)?;
        if !output.success() {
            return Err(command_failed("git", &full, &output, error_code, None));
        }
        Ok(output.stdout_text())
    }

    pub fn is_repository_root(&self, path: &Path) -> bool {
        match self.git(path, &["rev-parse", "--show-toplevel"]) {
            Ok((_, output)) if output.success() => {
                same_path(Path::new(output.stdout_text().trim()), path)
            }
            _ => false,
        }
    }

    pub fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        let (_, output) = self.git(repo, &["show-ref", "--verify", "--quiet", reference.as_str()])?;
        Ok(output.success())
    }

    pub fn current_branch(&self, repo: &Path) -> Option<String> {
        match self.git(repo, &["rev-parse", "--abbrev-ref", "HEAD"]) {
            Ok((_, output)) if output.success() => {
                let branch = output.stdout_text().trim().to_string();
                (!branch.is_empty() && branch != "HEAD").then_some(branch)
            }
            _ => None,
        }
    }

    pub fn list(&self, project: &Path) -> Result<Vec<WorktreeEntry>> {
        let stdout = self.git_ok(project, &["worktree", "list", "--porcelain"], "git_worktree_list_failed")?;
        Ok(parse_worktree_list(&stdout))
    }

    pub fn prune(&self, project: &Path) -> Result<()> {
        self.git_ok(project, &["worktree", "prune"], "git_worktree_prune_failed")?;
        Ok(())
    }

    fn tracked(&self, project: &Path, target: &Path) -> Result<Option<WorktreeEntry>> {
        Ok(self
            .list(project)?
            .into_iter()
            .find(|entry| same_path(&entry.path, target)))
    }

    /// Materialises `project/.worktrees/<name>` on branch `name`, creating
    /// the branch from HEAD when it does not exist yet.
    pub fn create(&self, project: &Path, name: &str, detach: bool) -> Result<PathBuf> {
        let target = workspace_path(project, name);

        if target.exists() {
            let mut tracked = self.tracked(project, &target)?;
            if tracked.is_none() {
                tracing::debug!(path = %target.display(), "untracked workspace directory; pruning");
                self.prune(project)?;
                tracked = self.tracked(project, &target)?;
            }
            match tracked {
                Some(entry) if entry.branch.as_deref() == Some(name) => {
                    tracing::info!(path = %target.display(), "reusing existing worktree");
                    self.ensure_excluded(project);
                    return Ok(target);
                }
                Some(entry) => {
                    let on = entry.branch.unwrap_or_else(|| "a detached HEAD".to_string());
                    if !detach {
                        return Err(DevxError::WorktreeConflict(format!(
                            "workspace {} exists on {on}, not '{name}'; pass --detach to recreate it",
                            target.display()
                        )));
                    }
                    tracing::warn!(path = %target.display(), "recreating worktree checked out on {on}");
                    self.remove(project, &target);
                }
                None => {
                    if !detach {
                        return Err(DevxError::WorktreeConflict(format!(
                            "{} exists but is not a git worktree; pass --detach to replace it",
                            target.display()
                        )));
                    }
                    tracing::warn!(path = %target.display(), "replacing stray workspace directory");
                    fs::remove_dir_all(&target)?;
                }
            }
        }

        if let Some(other) = self
            .list(project)?
            .into_iter()
            .find(|entry| entry.branch.as_deref() == Some(name))
        {
            return Err(DevxError::BranchInUse(format!(
                "branch '{name}' is already checked out at {}",
                other.path.display()
            )));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let target_arg = target.display().to_string();
        let args: Vec<&str> = if self.branch_exists(project, name)? {
            vec!["worktree", "add", target_arg.as_str(), name]
        } else {
            vec!["worktree", "add", "-b", name, target_arg.as_str()]
        };
        let (full, output) = self.git(project, &args)?;
        if !output.success() {
            let stderr = output.stderr_text();
            return Err(match classify_add_failure(&stderr) {
                Some("branch_in_use") => DevxError::BranchInUse(format!(
                    "branch '{name}' is already checked out in another worktree: {stderr}"
                )),
                Some(_) => DevxError::WorktreeConflict(format!(
                    "cannot create workspace {}: {stderr}",
                    target.display()
                )),
                None => command_failed(
                    "git",
                    &full,
                    &output,
                    "git_worktree_add_failed",
                    Some("run `git worktree list` in the project to inspect existing worktrees".to_string()),
                ),
            });
        }
        tracing::info!(path = %target.display(), branch = name, "created worktree");
        self.ensure_excluded(project);
        Ok(target)
    }

    /// Best effort: `worktree remove --force`, then plain directory removal.
    /// Returns a warning when the directory could not be removed.
    pub fn remove(&self, project: &Path, path: &Path) -> Option<String> {
        let path_arg = path.display().to_string();
        match self.git(project, &["worktree", "remove", "--force", path_arg.as_str()]) {
            Ok((_, output)) if output.success() => {}
            Ok((_, output)) => {
                tracing::debug!(stderr = %output.stderr_text(), "git worktree remove failed")
            }
            Err(err) => tracing::debug!(%err, "git worktree remove failed"),
        }
        if path.exists() {
            if let Err(err) = fs::remove_dir_all(path) {
                return Some(format!("failed to remove {}: {err}", path.display()));
            }
        }
        let _ = self.git(project, &["worktree", "prune"]);
        None
    }

    /// Fetches and fast-forwards `branch`. Remote problems are logged and
    /// skipped; anything else is an error.
    pub fn pull(&self, project: &Path, branch: &str) -> Result<()> {
        let (_, fetched) = self.git(project, &["fetch", "--quiet", "origin"])?;
        if !fetched.success() {
            let stderr = fetched.stderr_text();
            if is_tolerated_pull_failure(&stderr) {
                tracing::info!(%stderr, "skipping pull: fetch failed");
                return Ok(());
            }
            return Err(command_failed(
                "git",
                &["fetch".to_string(), "origin".to_string()],
                &fetched,
                "git_fetch_failed",
                None,
            ));
        }

        let refspec = format!("{branch}:{branch}");
        let args: Vec<&str> = if self.current_branch(project).as_deref() == Some(branch) {
            vec!["pull", "--ff-only", "--quiet", "origin", branch]
        } else {
            vec!["fetch", "--quiet", "origin", refspec.as_str()]
        };
        let (full, output) = self.git(project, &args)?;
        if output.success() {
            return Ok(());
        }
        let stderr = output.stderr_text();
        if is_tolerated_pull_failure(&stderr) {
            tracing::info!(%stderr, branch, "skipping fast-forward");
            return Ok(());
        }
        Err(command_failed("git", &full, &output, "git_pull_failed", None))
    }

    fn git_dir(&self, project: &Path) -> Option<PathBuf> {
        let (_, output) = self.git(project, &["rev-parse", "--git-common-dir"]).ok()?;
        if !output.success() {
            return None;
        }
        let raw = PathBuf::from(output.stdout_text().trim());
        if raw.as_os_str().is_empty() {
            return None;
        }
        Some(if raw.is_absolute() { raw } else { project.join(raw) })
    }

    /// Appends the worktree directory to `info/exclude` when missing.
    pub fn ensure_excluded(&self, project: &Path) {
        let Some(git_dir) = self.git_dir(project) else {
            return;
        };
        let exclude = git_dir.join("info").join("exclude");
        let existing = fs::read_to_string(&exclude).unwrap_or_default();
        if existing.lines().any(|line| line.trim() == EXCLUDE_ENTRY) {
            return;
        }
        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(EXCLUDE_ENTRY);
        content.push('\n');
        if let Some(parent) = exclude.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(err) = fs::write(&exclude, content) {
            tracing::warn!(%err, "failed to update {}", exclude.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::{fail, ok, FakeRunner};
    use tempfile::tempdir;

    const PORCELAIN: &str = "worktree /repo\nHEAD 1111\nbranch refs/heads/main\n\nworktree /repo/.worktrees/feat\nHEAD 2222\nbranch refs/heads/feat\n\nworktree /repo/.worktrees/detached\nHEAD 3333\ndetached\n";

    #[test]
    fn parses_porcelain_listing() {
        let entries = parse_worktree_list(PORCELAIN);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].path, PathBuf::from("/repo/.worktrees/feat"));
        assert_eq!(entries[1].head.as_deref(), Some("2222"));
        assert_eq!(entries[2].branch, None);
    }

    #[test]
    fn creates_new_branch_with_dash_b() {
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        runner.respond("git", "show-ref", fail(1, ""));
        let git = Git::new(&runner);

        let path = git.create(dir.path(), "feat-foo", false).unwrap();
        assert_eq!(path, dir.path().join(".worktrees").join("feat-foo"));
        let lines = runner.lines();
        let add = lines.iter().find(|l| l.contains("worktree add")).unwrap();
        assert!(add.ends_with(&format!("worktree add -b feat-foo {}", path.display())));
    }

    #[test]
    fn existing_branch_is_checked_out_without_dash_b() {
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        let git = Git::new(&runner);

        let path = git.create(dir.path(), "feat-foo", false).unwrap();
        let lines = runner.lines();
        let add = lines.iter().find(|l| l.contains("worktree add")).unwrap();
        assert!(add.ends_with(&format!("worktree add {} feat-foo", path.display())));
    }

    #[test]
    fn branch_checked_out_elsewhere_is_rejected() {
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        runner.respond(
            "git",
            "worktree list",
            ok("worktree /elsewhere\nHEAD 1\nbranch refs/heads/feat-foo\n"),
        );
        let git = Git::new(&runner);
        let err = git.create(dir.path(), "feat-foo", false).unwrap_err();
        assert!(matches!(err, DevxError::BranchInUse(_)));
        assert!(!runner.lines().iter().any(|l| l.contains("worktree add")));
    }

    #[test]
    fn add_failure_is_classified_from_stderr() {
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        runner.respond(
            "git",
            "worktree add",
            fail(128, "fatal: 'feat' is already checked out at '/x'"),
        );
        let git = Git::new(&runner);
        let err = git.create(dir.path(), "feat", false).unwrap_err();
        assert!(matches!(err, DevxError::BranchInUse(_)));

        let runner = FakeRunner::new();
        runner.respond("git", "worktree add", fail(128, "fatal: bad object HEAD"));
        let git = Git::new(&runner);
        let err = git.create(dir.path(), "feat", false).unwrap_err();
        assert_eq!(err.kind(), "subprocess_failure");
        assert!(err.to_string().contains("bad object HEAD"));
    }

    #[test]
    fn existing_worktree_on_same_branch_is_reused() {
        let dir = tempdir().unwrap();
        let target = workspace_path(dir.path(), "feat");
        fs::create_dir_all(&target).unwrap();
        let runner = FakeRunner::new();
        runner.respond(
            "git",
            "worktree list",
            ok(&format!(
                "worktree {}\nHEAD 1\nbranch refs/heads/feat\n",
                target.display()
            )),
        );
        let git = Git::new(&runner);
        assert_eq!(git.create(dir.path(), "feat", false).unwrap(), target);
        assert!(!runner.lines().iter().any(|l| l.contains("worktree add")));
    }

    #[test]
    fn existing_worktree_on_other_branch_needs_detach() {
        let dir = tempdir().unwrap();
        let target = workspace_path(dir.path(), "feat");
        fs::create_dir_all(&target).unwrap();
        let listing = format!(
            "worktree {}\nHEAD 1\nbranch refs/heads/other\n",
            target.display()
        );

        let runner = FakeRunner::new();
        runner.respond("git", "worktree list", ok(&listing));
        let err = Git::new(&runner).create(dir.path(), "feat", false).unwrap_err();
        assert!(matches!(err, DevxError::WorktreeConflict(_)));

        let runner = FakeRunner::new();
        runner.respond("git", "worktree list", ok(&listing));
        Git::new(&runner).create(dir.path(), "feat", true).unwrap();
        let lines = runner.lines();
        let remove_at = lines.iter().position(|l| l.contains("worktree remove --force")).unwrap();
        let add_at = lines.iter().position(|l| l.contains("worktree add")).unwrap();
        assert!(remove_at < add_at);
    }

    #[test]
    fn stray_directory_is_pruned_then_rejected_or_replaced() {
        let dir = tempdir().unwrap();
        let target = workspace_path(dir.path(), "feat");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("junk"), "x").unwrap();

        let runner = FakeRunner::new();
        let err = Git::new(&runner).create(dir.path(), "feat", false).unwrap_err();
        assert!(matches!(err, DevxError::WorktreeConflict(_)));
        assert!(runner.lines().iter().any(|l| l.ends_with("worktree prune")));

        let runner = FakeRunner::new();
        Git::new(&runner).create(dir.path(), "feat", true).unwrap();
        assert!(!target.join("junk").exists());
    }

    #[test]
    fn remove_falls_back_to_directory_removal() {
        let dir = tempdir().unwrap();
        let target = workspace_path(dir.path(), "feat");
        fs::create_dir_all(target.join("src")).unwrap();
        let runner = FakeRunner::new();
        runner.respond("git", "worktree remove", fail(128, "fatal: not a working tree"));
        assert!(Git::new(&runner).remove(dir.path(), &target).is_none());
        assert!(!target.exists());
    }

    #[test]
    fn pull_tolerates_missing_remote() {
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        runner.respond(
            "git",
            "fetch --quiet origin",
            fail(128, "fatal: 'origin' does not appear to be a git repository"),
        );
        Git::new(&runner).pull(dir.path(), "main").unwrap();
        assert!(!runner.lines().iter().any(|l| l.contains("pull")));
    }

    #[test]
    fn pull_fast_forwards_current_branch_and_fetches_others() {
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        runner.respond("git", "--abbrev-ref HEAD", ok("main\n"));
        let git = Git::new(&runner);
        git.pull(dir.path(), "main").unwrap();
        assert!(runner.lines().iter().any(|l| l.contains("pull --ff-only --quiet origin main")));

        git.pull(dir.path(), "develop").unwrap();
        assert!(runner.lines().iter().any(|l| l.contains("fetch --quiet origin develop:develop")));
    }

    #[test]
    fn divergence_is_swallowed() {
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        runner.respond("git", "--abbrev-ref HEAD", ok("main\n"));
        runner.respond(
            "git",
            "pull --ff-only",
            fail(128, "fatal: Not possible to fast-forward, aborting."),
        );
        Git::new(&runner).pull(dir.path(), "main").unwrap();
    }

    #[test]
    fn exclude_entry_is_appended_once() {
        let dir = tempdir().unwrap();
        let git_dir = dir.path().join(".git");
        fs::create_dir_all(git_dir.join("info")).unwrap();
        fs::write(git_dir.join("info").join("exclude"), "# comment").unwrap();
        let runner = FakeRunner::new();
        runner.respond("git", "--git-common-dir", ok(".git\n"));
        let git = Git::new(&runner);
        git.ensure_excluded(dir.path());
        git.ensure_excluded(dir.path());
        let content = fs::read_to_string(git_dir.join("info").join("exclude")).unwrap();
        assert_eq!(content, "# comment\n/.worktrees/\n");
    }
}
