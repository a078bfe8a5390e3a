//! The per-merge-request state machine.
//!
//! Drives a single merge request through Validate, Prepare, Update, Rewrite,
//! Push, AwaitCI, Reapprove and AcceptMerge, ending in `Success`, `Skipped`
//! or `Failed`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use thiserror::Error;

use crate::embargo::IntervalUnion;
use crate::forge::{
    ForgeClient, ForgeError, MergeRequest, MergeRequestState, PipelineStatus, Project, ProjectId,
    User,
};
use crate::git::{FuseStrategy, GitWorkingCopy, WorkingCopyError};
use crate::trailers::{RewriteSpan, TrailerPolicy, TrailerToggles};

/// How a merge job brings the target branch's changes into the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Rebase the source branch onto the target.
    Rebase,
    /// Merge the target into the source, leaving a merge commit.
    Merge,
    /// Try a rebase; on any Git failure, merge instead.
    RebaseThenMerge,
}

impl MergeStrategy {
    fn as_fuse(self) -> FuseStrategy {
        match self {
            MergeStrategy::Rebase => FuseStrategy::Rebase,
            MergeStrategy::Merge => FuseStrategy::Merge,
            MergeStrategy::RebaseThenMerge => FuseStrategy::RebaseThenMerge,
        }
    }

    /// Whether this strategy leaves the source branch's history rewritten in
    /// place (as opposed to merging target history into it), which is what
    /// makes a `Tested-by` trailer meaningful.
    fn rebases_in_place(self) -> bool {
        !matches!(self, MergeStrategy::Merge)
    }
}

/// Options controlling a cycle of merge jobs.
///
/// Toggles for trailers, timing knobs, and the chosen strategy. Immutable
/// for the lifetime of a job.
#[derive(Debug, Clone)]
pub struct MergeJobOptions {
    /// Which trailers to stamp on rewritten commits.
    pub trailers: TrailerToggles,
    /// Re-approve on behalf of prior approvers after a force-push.
    pub reapprove: bool,
    /// How long to wait for approvals to settle after a force-push.
    pub approval_timeout: Duration,
    /// Windows during which no merge may proceed.
    pub embargo: IntervalUnion,
    /// How long to wait for CI to complete.
    pub ci_timeout: Duration,
    /// Skip (rather than fail) a merge request whose CI takes too long.
    pub ci_timeout_skip: bool,
    /// The fuse strategy to use.
    pub merge_strategy: MergeStrategy,
    /// Start a pipeline under the bot's identity if none exists yet.
    pub require_ci_run_by_me: bool,
}

impl MergeJobOptions {
    /// Whether this configuration is internally consistent.
    ///
    /// `merge_strategy = Merge` cannot coexist with `add_tested`, since a
    /// merge commit has no single rewritten tip to attach a `Tested-by` to.
    pub fn is_valid(&self) -> bool {
        strategy_allows_tested_by(self.merge_strategy, self.trailers.add_tested)
    }
}

/// Whether `strategy` and a `Tested-by` trailer toggle are compatible.
///
/// `merge_strategy = merge` is mutually exclusive with `add_tested`, since a
/// plain merge leaves the source commits unrewritten and there is nothing to
/// stamp a `Tested-by` trailer onto. [`MergeJobOptions::is_valid`] and the
/// CLI's configuration loader both defer to this single check.
pub fn strategy_allows_tested_by(strategy: MergeStrategy, add_tested: bool) -> bool {
    !(strategy == MergeStrategy::Merge && add_tested)
}

/// The poll interval while waiting for CI to complete.
pub(crate) const CI_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// The poll interval while waiting for approvals to settle.
const APPROVAL_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// How long to keep retrying a transient forge failure while accepting a
/// merge request.
const MERGE_RETRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// The initial backoff between accept-merge retries, doubled each attempt.
const MERGE_RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// The backoff between accept-merge retries never grows past this.
const MERGE_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A terminal, non-`Success` outcome that still counts as "handled".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The merge request was merged.
    Success,
    /// The merge request was left alone for now; assignment is unchanged.
    Skipped(String),
}

/// Errors (and the `Skip` pseudo-error) produced while running a job.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobError {
    /// The merge request is temporarily ineligible; try again later.
    #[error("{}", reason)]
    Skip {
        /// Why the merge request was skipped.
        reason: String,
    },
    /// The merge request will not merge as-is; a human needs to intervene.
    #[error("{}", reason)]
    Fail {
        /// Why the merge request was failed.
        reason: String,
    },
    /// Something unexpected happened; the working copy may be inconsistent.
    #[error("fatal error: {}", reason)]
    Fatal {
        /// A description of the fatal condition.
        reason: String,
    },
}

impl JobError {
    pub(crate) fn skip<S: Into<String>>(reason: S) -> Self {
        JobError::Skip {
            reason: reason.into(),
        }
    }

    pub(crate) fn fail<S: Into<String>>(reason: S) -> Self {
        JobError::Fail {
            reason: reason.into(),
        }
    }

    pub(crate) fn fatal<S: Into<String>>(reason: S) -> Self {
        JobError::Fatal {
            reason: reason.into(),
        }
    }
}

impl From<ForgeError> for JobError {
    fn from(source: ForgeError) -> Self {
        JobError::fail(format!("forge error: {}", source))
    }
}

/// A clock abstraction so tests can drive polling loops without sleeping.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> chrono::DateTime<Utc>;
    /// Block for `duration`.
    fn sleep(&self, duration: Duration);
    /// Whether a termination signal has been observed.
    ///
    /// Checked at every iteration of the `AwaitCI` and `Reapprove` polling
    /// loops so a process-level signal stops the job at the next step
    /// boundary rather than waiting out the rest of a sleep.
    fn cancelled(&self) -> bool {
        false
    }
}

/// The real clock, backed by the operating system.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> chrono::DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Wraps a clock with a shared flag checked by [`Clock::cancelled`].
///
/// The CLI's signal handler flips the flag; every polling loop in this
/// module observes it on the next iteration.
pub struct CancellableClock<C> {
    inner: C,
    flag: Arc<std::sync::atomic::AtomicBool>,
}

impl<C> CancellableClock<C> {
    /// Wrap `inner`, observing `flag` for cancellation.
    pub fn new(inner: C, flag: Arc<std::sync::atomic::AtomicBool>) -> Self {
        Self {
            inner,
            flag,
        }
    }
}

impl<C: Clock> Clock for CancellableClock<C> {
    fn now(&self) -> chrono::DateTime<Utc> {
        self.inner.now()
    }

    fn sleep(&self, duration: Duration) {
        self.inner.sleep(duration);
    }

    fn cancelled(&self) -> bool {
        self.flag.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Cleans up the local working copy on every exit path out of a job.
///
/// Runs in `Drop` so that it fires on `Success`, `Skipped`, `Failed`, and on
/// panicking unwinds alike, mirroring the "always finalize" rule.
struct BranchCleanup<'a> {
    git: &'a GitWorkingCopy,
    branch: String,
}

impl<'a> Drop for BranchCleanup<'a> {
    fn drop(&mut self) {
        if self.branch == "master" {
            return;
        }
        if let Err(err) = self.git.checkout_branch("master") {
            warn!(target: "mergebot/job", "failed to check out master during cleanup: {}", err);
            return;
        }
        if let Err(err) = self.git.remove_branch(&self.branch) {
            warn!(target: "mergebot/job", "failed to remove {}: {}", self.branch, err);
        }
    }
}

/// Drives a single merge request through the state machine.
pub struct MergeJob {
    forge: Arc<dyn ForgeClient>,
    git: GitWorkingCopy,
    options: MergeJobOptions,
    clock: Arc<dyn Clock>,
    bot_name: String,
}

impl MergeJob {
    /// Create a job against the real clock.
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        git: GitWorkingCopy,
        options: MergeJobOptions,
        bot_name: String,
    ) -> Self {
        Self::with_clock(forge, git, options, bot_name, Arc::new(SystemClock))
    }

    /// Create a job against an injected clock, for tests.
    pub fn with_clock(
        forge: Arc<dyn ForgeClient>,
        git: GitWorkingCopy,
        options: MergeJobOptions,
        bot_name: String,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            forge,
            git,
            options,
            clock,
            bot_name,
        }
    }

    /// Run the job for the merge request `iid` on `project_id`.
    pub fn run(&self, project_id: ProjectId, iid: u64) -> Result<JobOutcome, JobError> {
        let self_user = self.forge.myself()?;

        let result = self.run_inner(project_id, iid, &self_user);

        match result {
            Ok(outcome) => Ok(outcome),
            Err(JobError::Skip {
                reason,
            }) => Ok(JobOutcome::Skipped(reason)),
            Err(err @ JobError::Fail {
                ..
            }) => {
                self.unassign(project_id, iid, &self_user);
                Err(err)
            },
            Err(err) => Err(err),
        }
    }

    fn unassign(&self, project_id: ProjectId, iid: u64, self_user: &User) {
        let outcome = match self.forge.refetch_merge_request(project_id, iid) {
            Ok(mr) if mr.author_id != self_user.id => {
                self.forge.assign(project_id, iid, mr.author_id)
            },
            Ok(_) => self.forge.unassign(project_id, iid),
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            warn!(target: "mergebot/job", "failed to unassign after failure: {}", err);
        }
    }

    fn run_inner(
        &self,
        project_id: ProjectId,
        iid: u64,
        self_user: &User,
    ) -> Result<JobOutcome, JobError> {
        let mr = self.validate(project_id, iid, self_user)?;
        let project = self.forge.project(mr.source_project_id)?;
        let target_project = self.forge.project(project_id)?;

        let _cleanup = BranchCleanup {
            git: &self.git,
            branch: mr.source_branch.clone(),
        };

        self.prepare(&mr, &project)?;
        let updated_sha = self.update(&mr)?;
        let rewritten_sha = self.rewrite(&mr, &target_project, &updated_sha)?;
        self.push(&mr, &project, &rewritten_sha)?;
        self.await_ci(&mr, &rewritten_sha)?;

        if self.options.reapprove {
            self.reapprove(project_id, iid)?;
        }

        self.accept_merge(project_id, iid, &rewritten_sha)?;

        Ok(JobOutcome::Success)
    }

    /// Validate: re-fetch and reject ineligible merge requests.
    fn validate(
        &self,
        project_id: ProjectId,
        iid: u64,
        self_user: &User,
    ) -> Result<MergeRequest, JobError> {
        let mr = self.forge.refetch_merge_request(project_id, iid)?;

        if mr.work_in_progress {
            return Err(JobError::fail("work in progress"));
        }
        if mr.squash && self.options.trailers.requests_commit_tagging() {
            return Err(JobError::fail("squash ruins trailers"));
        }

        let approvals = self.forge.approvals(project_id, iid)?;
        if !approvals.sufficient() {
            return Err(JobError::fail("insufficient approvals to merge"));
        }

        match mr.state {
            MergeRequestState::Merged | MergeRequestState::Closed => {
                return Err(JobError::skip(format!("already {:?}", mr.state)));
            },
            MergeRequestState::Opened | MergeRequestState::Reopened | MergeRequestState::Locked => {
            },
        }

        if self.options.embargo.covers(self.clock.now()) {
            return Err(JobError::skip("embargo"));
        }

        if !mr.is_assigned_to(self_user.id) {
            return Err(JobError::skip("unassigned"));
        }

        Ok(mr)
    }

    /// Prepare: add a remote for a fork source, if any.
    fn prepare(&self, mr: &MergeRequest, source_project: &Project) -> Result<(), JobError> {
        if mr.source_project_id == mr.project_id && mr.source_branch == mr.target_branch {
            return Err(JobError::fail("source and target branch coincide"));
        }

        self.git
            .fetch(&source_project.ssh_url_to_repo, &mr.source_branch)
            .map_err(git_fail("fetch"))?;

        Ok(())
    }

    /// Update: fuse the target into the source branch.
    fn update(&self, mr: &MergeRequest) -> Result<String, JobError> {
        let target_ref = format!("origin/{}", mr.target_branch);

        let updated = self
            .git
            .fuse(self.options.merge_strategy.as_fuse(), &mr.source_branch, &target_ref)
            .map_err(git_fail("fuse"))?;

        let target_sha = self
            .git
            .commit_hash(&target_ref)
            .map_err(git_fail("rev-parse target"))?;

        if updated == target_sha {
            return Err(JobError::fail(format!(
                "these changes already exist in branch {}",
                mr.target_branch
            )));
        }

        Ok(updated.as_str().to_owned())
    }

    /// Rewrite: apply the configured trailers, in order.
    fn rewrite(
        &self,
        mr: &MergeRequest,
        target_project: &Project,
        updated_sha: &str,
    ) -> Result<String, JobError> {
        let policy = TrailerPolicy::new(self.options.trailers, &self.bot_name);
        let approvals = self.forge.approvals(mr.project_id, mr.iid)?;
        let planned = policy.plan(
            &*self.forge,
            mr,
            target_project,
            &approvals,
            self.options.merge_strategy.rebases_in_place(),
        )?;

        let mut tip = updated_sha.to_owned();
        for planned_trailer in planned {
            let start = match planned_trailer.span {
                RewriteSpan::SinceTarget => format!("origin/{}", mr.target_branch),
                RewriteSpan::TipOnly => format!("{}^", tip),
            };

            let new_tip = self
                .git
                .tag_with_trailer(
                    &planned_trailer.trailer.token,
                    &planned_trailer.trailer.value,
                    &mr.source_branch,
                    &start,
                )
                .map_err(git_fail("tag_with_trailer"))?;
            tip = new_tip.as_str().to_owned();
        }

        Ok(tip)
    }

    /// Push: force-push the rewritten branch to its source project.
    fn push(
        &self,
        mr: &MergeRequest,
        source_project: &Project,
        rewritten_sha: &str,
    ) -> Result<(), JobError> {
        let branch = self
            .forge
            .branch(mr.source_project_id, &mr.source_branch)?;
        if branch.protected {
            return Err(JobError::fail("can't push to protected branches"));
        }

        debug!(
            target: "mergebot/job",
            "pushing {} ({}) to {}",
            mr.source_branch, rewritten_sha, source_project.ssh_url_to_repo,
        );

        self.git
            .push(&source_project.ssh_url_to_repo, &mr.source_branch)
            .map_err(|err| {
                JobError::fail(format!(
                    "failed to push with strategy {:?}: {}",
                    self.options.merge_strategy, err
                ))
            })
    }

    /// AwaitCI: poll pipelines on the source branch until one completes.
    fn await_ci(&self, mr: &MergeRequest, rewritten_sha: &str) -> Result<(), JobError> {
        let deadline = self.clock.now() + chrono::Duration::from_std(self.options.ci_timeout)
            .map_err(|_| JobError::fatal("invalid ci_timeout"))?;
        let mut started_ours = false;

        loop {
            let pipelines = self
                .forge
                .pipelines_for_branch(mr.source_project_id, &mr.source_branch)?;
            let matching = pipelines
                .iter()
                .find(|pipeline| pipeline.sha.as_str() == rewritten_sha);

            match matching.map(|pipeline| pipeline.status) {
                Some(PipelineStatus::Success) | Some(PipelineStatus::Skipped) => return Ok(()),
                Some(PipelineStatus::Failed) => return Err(JobError::fail("CI failed")),
                Some(PipelineStatus::Canceled) => {
                    return Err(JobError::fail("someone canceled the CI"))
                },
                Some(PipelineStatus::Pending)
                | Some(PipelineStatus::Running)
                | Some(PipelineStatus::Created) => {},
                None if self.options.require_ci_run_by_me && !started_ours => {
                    self.forge
                        .start_pipeline(mr.source_project_id, &mr.source_branch, None)?;
                    started_ours = true;
                },
                None => {
                    warn!(target: "mergebot/job", "no pipeline found yet for {}", mr.web_url);
                },
            }

            if self.clock.now() >= deadline {
                return if self.options.ci_timeout_skip {
                    Err(JobError::skip("CI is taking too long"))
                } else {
                    Err(JobError::fail("CI is taking too long"))
                };
            }

            if self.clock.cancelled() {
                return Err(JobError::skip("terminating"));
            }

            self.clock.sleep(CI_POLL_INTERVAL);
        }
    }

    /// Reapprove: wait for approvals to settle, re-approving if they reset.
    fn reapprove(&self, project_id: ProjectId, iid: u64) -> Result<(), JobError> {
        let deadline = self.clock.now()
            + chrono::Duration::from_std(self.options.approval_timeout)
                .map_err(|_| JobError::fatal("invalid approval_timeout"))?;

        loop {
            if self.clock.cancelled() {
                return Err(JobError::skip("terminating"));
            }

            let approvals = self.forge.approvals(project_id, iid)?;
            if !approvals.sufficient() {
                self.forge.reapprove(project_id, iid)?;
                return Ok(());
            }

            if self.clock.now() >= deadline {
                return Ok(());
            }

            self.clock.sleep(APPROVAL_POLL_INTERVAL);
        }
    }

    /// AcceptMerge: re-check the tip, then ask the forge to merge.
    ///
    /// A transient forge failure (`ForgeError::Api`) is retried with
    /// exponential backoff up to `MERGE_RETRY_TIMEOUT`; a definitive one
    /// (`ForgeError::NotFound`) fails the job immediately.
    fn accept_merge(
        &self,
        project_id: ProjectId,
        iid: u64,
        rewritten_sha: &str,
    ) -> Result<(), JobError> {
        let mr = self.forge.refetch_merge_request(project_id, iid)?;
        if mr.sha.as_str() != rewritten_sha {
            return Err(JobError::skip(
                "someone pushed to the branch while waiting for CI",
            ));
        }

        let deadline = self.clock.now()
            + chrono::Duration::from_std(MERGE_RETRY_TIMEOUT)
                .expect("MERGE_RETRY_TIMEOUT fits in a chrono::Duration");
        let mut backoff = MERGE_RETRY_INITIAL_BACKOFF;

        loop {
            match self.forge.accept_merge_request(project_id, iid, None) {
                Ok(()) => return Ok(()),
                Err(err @ ForgeError::NotFound {
                    ..
                }) => return Err(JobError::fail(format!("forge refused to merge: {}", err))),
                Err(err) => {
                    if self.clock.now() >= deadline {
                        return Err(JobError::fail(format!("forge refused to merge: {}", err)));
                    }
                    warn!(target: "mergebot/job", "transient error accepting merge, retrying: {}", err);
                    self.clock.sleep(backoff);
                    backoff = (backoff * 2).min(MERGE_RETRY_MAX_BACKOFF);
                },
            }
        }
    }
}

fn git_fail(step: &'static str) -> impl Fn(WorkingCopyError) -> JobError {
    move |err| JobError::fail(format!("{} failed: {}", step, err))
}
