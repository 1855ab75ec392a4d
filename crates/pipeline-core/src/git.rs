use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};

use crate::template::{render, TemplateVars};
use crate::types::BranchStrategy;

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// A commit created on behalf of a stage.
#[derive(Debug, Clone)]
pub struct StageCommit {
    pub sha: String,
    pub message: String,
}

/// Thin capability layer over the `git` CLI, bound to one working tree.
/// The engine holds two of these per run: one on the main repository and
/// one on the execution worktree.
pub struct Git {
    pub repo_path: PathBuf,
}

impl Git {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn exec(&self, args: &[&str]) -> Result<ExecResult> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_path)
            .args(args)
            .output()
            .with_context(|| {
                format!(
                    "failed to spawn git -C {} {}",
                    self.repo_path.display(),
                    args.join(" ")
                )
            })?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    fn exec_ok(&self, args: &[&str]) -> Result<ExecResult> {
        let result = self.exec(args)?;
        if !result.success() {
            return Err(anyhow!(
                "git {} failed in {}: {}",
                args.join(" "),
                self.repo_path.display(),
                result.combined_output()
            ));
        }
        Ok(result)
    }

    /// `git --version`, used by preflight.
    pub fn available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    // ── Inspection ───────────────────────────────────────────────────────

    pub fn head_sha(&self) -> Result<String> {
        self.rev_parse("HEAD")
    }

    pub fn rev_parse(&self, refname: &str) -> Result<String> {
        Ok(self.exec_ok(&["rev-parse", refname])?.stdout.trim().to_string())
    }

    pub fn current_branch(&self) -> Result<String> {
        Ok(self
            .exec_ok(&["rev-parse", "--abbrev-ref", "HEAD"])?
            .stdout
            .trim()
            .to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.exec(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .map(|r| r.success())
            .unwrap_or(false)
    }

    /// Files changed between `base` and the current HEAD.
    pub fn changed_files_since(&self, base: &str) -> Result<Vec<String>> {
        let range = format!("{base}..HEAD");
        let result = self.exec_ok(&["diff", "--name-only", &range])?;
        Ok(result
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    pub fn has_uncommitted_changes(&self) -> Result<bool> {
        let result = self.exec_ok(&["status", "--porcelain"])?;
        Ok(!result.stdout.trim().is_empty())
    }

    /// Path of the worktree that has `branch` checked out, if any.
    /// Parses `git worktree list --porcelain`.
    pub fn branch_checkout_path(&self, branch: &str) -> Result<Option<PathBuf>> {
        let result = self.exec_ok(&["worktree", "list", "--porcelain"])?;
        let needle = format!("refs/heads/{branch}");
        let mut current: Option<PathBuf> = None;
        for line in result.stdout.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current = Some(PathBuf::from(path));
            } else if let Some(refname) = line.strip_prefix("branch ") {
                if refname == needle {
                    return Ok(current);
                }
            }
        }
        Ok(None)
    }

    // ── Commits ──────────────────────────────────────────────────────────

    /// Stage everything and commit with the templated pipeline prefix plus
    /// an optional user message. Returns `None` when the tree was clean.
    pub fn create_stage_commit(
        &self,
        commit_prefix: &str,
        vars: &TemplateVars<'_>,
        user_message: Option<&str>,
    ) -> Result<Option<StageCommit>> {
        self.exec_ok(&["add", "-A"])?;

        let status = self.exec_ok(&["status", "--porcelain"])?;
        if status.stdout.trim().is_empty() {
            return Ok(None);
        }

        let mut message = render(commit_prefix, vars);
        if let Some(user) = user_message.filter(|m| !m.is_empty()) {
            if !message.is_empty() {
                message.push_str("\n\n");
            }
            message.push_str(&render(user, vars));
        }
        if message.trim().is_empty() {
            message = format!("pipeline commit ({})", vars.stage);
        }

        self.exec_ok(&["commit", "-m", &message])?;
        Ok(Some(StageCommit {
            sha: self.head_sha()?,
            message,
        }))
    }

    pub fn merge_no_ff(&self, branch: &str) -> Result<()> {
        self.exec_ok(&["merge", "--no-ff", branch])?;
        Ok(())
    }

    pub fn push_branch(&self, branch: &str) -> Result<()> {
        self.exec_ok(&["push", "-u", "origin", branch])?;
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.exec_ok(&["branch", "-D", branch])?;
        Ok(())
    }

    // ── Worktrees ────────────────────────────────────────────────────────

    /// Create a worktree at `path` for `branch`. A missing branch is
    /// created from `base`; an existing one is checked out as-is.
    pub fn create_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        let result = if self.branch_exists(branch) {
            self.exec(&["worktree", "add", &path_str, branch])?
        } else {
            self.exec(&["worktree", "add", &path_str, "-b", branch, base])?
        };
        if !result.success() {
            return Err(anyhow!(
                "git worktree add failed for branch={branch} base={base}: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        let result = self.exec(&["worktree", "remove", "--force", &path_str])?;
        if !result.success() {
            return Err(anyhow!(
                "git worktree remove failed for {path_str}: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn prune_worktrees(&self) -> Result<()> {
        self.exec_ok(&["worktree", "prune"])?;
        Ok(())
    }
}

// ── Branch allocation ────────────────────────────────────────────────────

/// Branch name for a run under the configured strategy.
pub fn allocate_branch(
    strategy: BranchStrategy,
    prefix: &str,
    pipeline_name: &str,
    short_run_id: &str,
) -> String {
    let slug = slugify(pipeline_name);
    match strategy {
        BranchStrategy::Reusable => format!("{prefix}/{slug}"),
        BranchStrategy::UniquePerRun | BranchStrategy::UniqueAndDelete => {
            format!("{prefix}/{slug}-{short_run_id}")
        }
    }
}

fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reusable_branch_is_stable_across_runs() {
        let a = allocate_branch(BranchStrategy::Reusable, "pipeline", "Nightly Build", "aaaa1111");
        let b = allocate_branch(BranchStrategy::Reusable, "pipeline", "Nightly Build", "bbbb2222");
        assert_eq!(a, b);
        assert_eq!(a, "pipeline/nightly-build");
    }

    #[test]
    fn unique_strategies_embed_run_id() {
        let a = allocate_branch(BranchStrategy::UniquePerRun, "pipeline", "fix", "aaaa1111");
        assert_eq!(a, "pipeline/fix-aaaa1111");
        let b = allocate_branch(BranchStrategy::UniqueAndDelete, "pipeline", "fix", "aaaa1111");
        assert_eq!(a, b);
    }

    #[test]
    fn slug_normalizes_odd_characters() {
        assert_eq!(slugify("My Pipeline/v2"), "my-pipeline-v2");
    }
}
