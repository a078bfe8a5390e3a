//! A Git working copy under a wall-clock deadline per operation.

use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;

use git_workarea::{CommitId, GitContext, GitError};
use tempfile::NamedTempFile;
use thiserror::Error;
use wait_timeout::ChildExt;

/// How long a single `git` subprocess is allowed to run before being killed.
const ZOMBIE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors performing Git operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkingCopyError {
    /// A `git` subcommand failed.
    #[error("git error: {}", source)]
    Git {
        /// The source of the error.
        #[from]
        source: GitError,
    },
    /// A `git` subcommand did not complete within its deadline.
    #[error("`git {}` did not complete within {:?}", command, timeout)]
    Timeout {
        /// The subcommand that timed out.
        command: &'static str,
        /// The deadline that was exceeded.
        timeout: Duration,
    },
    /// Setting up the trailer rewrite script failed.
    #[error("failed to prepare the trailer rewrite script: {}", source)]
    ScriptSetup {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
    /// A `git` subcommand exited unsuccessfully.
    #[error("`git {}` failed: {}", command, stderr)]
    CommandFailed {
        /// The subcommand that failed.
        command: &'static str,
        /// Its stderr output.
        stderr: String,
    },
}

impl WorkingCopyError {
    fn timeout(command: &'static str, timeout: Duration) -> Self {
        WorkingCopyError::Timeout {
            command,
            timeout,
        }
    }

    fn command_failed(command: &'static str, stderr: &[u8]) -> Self {
        WorkingCopyError::CommandFailed {
            command,
            stderr: String::from_utf8_lossy(stderr).into(),
        }
    }
}

type WorkingCopyResult<T> = Result<T, WorkingCopyError>;

/// The strategy used to bring a target branch's changes into a source branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseStrategy {
    /// Rebase the source branch onto the target.
    Rebase,
    /// Merge the target branch into the source.
    Merge,
    /// Try a rebase; if it fails for any reason, merge instead.
    RebaseThenMerge,
}

/// A working copy of a repository, with every operation bounded by a deadline.
///
/// Wraps a [`GitContext`] the same way the rest of the crate's Git operations
/// do, but kills the subprocess rather than letting a wedged `git` hang the
/// merge job forever.
pub struct GitWorkingCopy {
    ctx: GitContext,
    timeout: Duration,
}

impl GitWorkingCopy {
    /// Wrap a context with a per-operation deadline.
    pub fn new(ctx: GitContext, timeout: Duration) -> Self {
        Self {
            ctx,
            timeout,
        }
    }

    fn run(&self, name: &'static str, command: &mut Command) -> WorkingCopyResult<Vec<u8>> {
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|err| WorkingCopyError::from(GitError::subcommand(name, err)))?;

        let status = child
            .wait_timeout(self.timeout)
            .map_err(|err| WorkingCopyError::from(GitError::subcommand(name, err)))?;

        let status = match status {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait_timeout(ZOMBIE_TIMEOUT);
                return Err(WorkingCopyError::timeout(name, self.timeout));
            },
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            use std::io::Read;
            let _ = out.read_to_end(&mut stdout);
        }
        if let Some(mut err) = child.stderr.take() {
            use std::io::Read;
            let _ = err.read_to_end(&mut stderr);
        }

        if !status.success() {
            return Err(WorkingCopyError::command_failed(name, &stderr));
        }

        Ok(stdout)
    }

    /// Fetch a ref from a remote URL.
    pub fn fetch(&self, url: &str, refname: &str) -> WorkingCopyResult<()> {
        self.run(
            "fetch",
            self.ctx.git().arg("fetch").arg(url).arg(refname),
        )?;
        Ok(())
    }

    /// Check out a local branch by name.
    pub fn checkout_branch(&self, branch: &str) -> WorkingCopyResult<()> {
        self.run("checkout", self.ctx.git().arg("checkout").arg(branch))?;
        Ok(())
    }

    /// Delete a local branch.
    pub fn remove_branch(&self, branch: &str) -> WorkingCopyResult<()> {
        self.run(
            "branch -D",
            self.ctx.git().arg("branch").arg("-D").arg(branch),
        )?;
        Ok(())
    }

    /// Create (or reset) a local branch to point at `start`.
    pub fn create_branch(&self, branch: &str, start: &str) -> WorkingCopyResult<()> {
        self.run(
            "branch -f",
            self.ctx.git().arg("branch").arg("-f").arg(branch).arg(start),
        )?;
        Ok(())
    }

    /// The commit hash a ref currently resolves to.
    pub fn commit_hash(&self, reference: &str) -> WorkingCopyResult<CommitId> {
        let output = self.run("rev-parse", self.ctx.git().arg("rev-parse").arg(reference))?;
        let hash = String::from_utf8_lossy(&output).trim().to_string();
        Ok(CommitId::new(hash))
    }

    /// Rebase `source` onto `target`, returning the new tip of `source`.
    pub fn rebase(&self, source: &str, target: &str) -> WorkingCopyResult<CommitId> {
        self.checkout_branch(source)?;
        self.run("rebase", self.ctx.git().arg("rebase").arg(target))?;
        self.commit_hash(source)
    }

    /// Merge `target` into `source`, returning the new tip of `source`.
    pub fn merge(&self, source: &str, target: &str) -> WorkingCopyResult<CommitId> {
        self.checkout_branch(source)?;
        self.run(
            "merge",
            self.ctx
                .git()
                .arg("merge")
                .arg("--no-ff")
                .arg(target)
                .arg("-m")
                .arg(format!("Merge branch '{}' into '{}'", target, source)),
        )?;
        self.commit_hash(source)
    }

    /// Fuse `target` into `source` using the given strategy.
    pub fn fuse(
        &self,
        strategy: FuseStrategy,
        source: &str,
        target: &str,
    ) -> WorkingCopyResult<CommitId> {
        match strategy {
            FuseStrategy::Rebase => self.rebase(source, target),
            FuseStrategy::Merge => self.merge(source, target),
            FuseStrategy::RebaseThenMerge => {
                self.run("rebase --abort", self.ctx.git().arg("rebase").arg("--abort"))
                    .ok();
                self.rebase(source, target)
                    .or_else(|_| self.merge(source, target))
            },
        }
    }

    /// Force-push `branch`'s local tip to `url`.
    pub fn push(&self, url: &str, branch: &str) -> WorkingCopyResult<()> {
        self.run(
            "push",
            self.ctx
                .git()
                .arg("push")
                .arg("--force")
                .arg(url)
                .arg(format!("{}:{}", branch, branch)),
        )?;
        Ok(())
    }

    /// Rewrite every commit in `start..branch` to append a trailer, returning
    /// the new tip.
    ///
    /// Implemented with `git filter-branch --msg-filter`: a small script is
    /// written to a temp file and invoked once per rewritten commit,
    /// appending the trailer line if it is not already present. When several
    /// trailers are applied in successive calls, each one lands directly
    /// below the last rather than opening a new paragraph, so the result is
    /// one contiguous trailer block rather than several. The trailer line
    /// itself (built from a forge user's name and email, neither of which
    /// this process controls) is passed to the script through an environment
    /// variable rather than interpolated into the script's text, so a name
    /// or email containing shell metacharacters can't break out of the
    /// generated script.
    pub fn tag_with_trailer(
        &self,
        trailer_name: &str,
        trailer_value: &str,
        branch: &str,
        start: &str,
    ) -> WorkingCopyResult<CommitId> {
        let mut script = NamedTempFile::new()?;
        writeln!(script, "#!/bin/sh")?;
        writeln!(script, "msg=\"$(cat)\"")?;
        writeln!(
            script,
            "if printf '%s\\n' \"$msg\" | grep -qF \"$MERGEBOT_TRAILER_LINE\"; then"
        )?;
        writeln!(script, "  printf '%s\\n' \"$msg\"")?;
        writeln!(
            script,
            "elif printf '%s\\n' \"$msg\" | tail -n 1 | grep -qE '^[A-Za-z][A-Za-z0-9_-]*: '; then"
        )?;
        writeln!(script, "  printf '%s\\n%s\\n' \"$msg\" \"$MERGEBOT_TRAILER_LINE\"")?;
        writeln!(script, "else")?;
        writeln!(script, "  printf '%s\\n\\n%s\\n' \"$msg\" \"$MERGEBOT_TRAILER_LINE\"")?;
        writeln!(script, "fi")?;
        script.flush()?;

        let script_path = script.path();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(script_path)?.permissions();
            perms.set_mode(0o700);
            std::fs::set_permissions(script_path, perms)?;
        }

        let trailer_line = format!("{}: {}", trailer_name, trailer_value);

        self.run(
            "filter-branch",
            self.ctx
                .git()
                .arg("filter-branch")
                .arg("--force")
                .arg("--msg-filter")
                .arg(format!("sh {}", script_path.display()))
                .arg(format!("{}..{}", start, branch))
                .env("FILTER_BRANCH_SQUELCH_WARNING", "1")
                .env("MERGEBOT_TRAILER_LINE", &trailer_line),
        )?;

        self.commit_hash(branch)
    }
}
