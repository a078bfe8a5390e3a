//! Fusing several merge requests onto one staging branch for a single CI run.

use std::sync::Arc;

use log::{info, warn};

use crate::forge::{ForgeClient, MergeRequest, PipelineStatus, ProjectId};
use crate::git::{FuseStrategy, GitWorkingCopy};
use crate::job::{Clock, JobError, MergeJobOptions, MergeStrategy, SystemClock, CI_POLL_INTERVAL};

/// The local name of the synthetic staging branch a batch is built on.
const STAGING_BRANCH: &str = "mergebot/batch";

/// The outcome of attempting a batch.
#[derive(Debug)]
pub enum BatchOutcome {
    /// Every constituent merge request was merged.
    Success(Vec<u64>),
    /// One merge request could not be fused, pushed, or failed CI; it and
    /// everything after it in processing order are deferred to per-MR
    /// handling by the scheduler.
    PartialFailure {
        /// Merge requests merged before the failure.
        merged: Vec<u64>,
        /// The merge request whose fuse, push, or CI failed.
        failed_iid: u64,
        /// Why it failed.
        reason: String,
        /// Merge requests not yet attempted.
        deferred: Vec<u64>,
    },
}

/// Fuses several merge requests sharing a target branch onto a single
/// staging branch and tests and merges them together.
///
/// Grounded on the same "fuse many things, then land them" shape used for
/// merging one change into several target branches, turned inside out: here
/// several merge requests land on one staging branch instead of one change
/// landing on several targets.
pub struct BatchJob {
    forge: Arc<dyn ForgeClient>,
    git: GitWorkingCopy,
    options: MergeJobOptions,
    clock: Arc<dyn Clock>,
}

impl BatchJob {
    /// Create a batch job against the real clock.
    ///
    /// `options.merge_strategy` must be `Rebase` or `RebaseThenMerge` and
    /// `options.trailers.add_tested` must be unset; the CLI's configuration
    /// loader rejects both combinations before a batch is ever formed (see
    /// `MergeJobOptions::is_valid` and `mergebot_cli::config::Config::load`).
    /// `run` still re-checks the strategy below, since nothing else
    /// constructs a `BatchJob`.
    pub fn new(forge: Arc<dyn ForgeClient>, git: GitWorkingCopy, options: MergeJobOptions) -> Self {
        Self::with_clock(forge, git, options, Arc::new(SystemClock))
    }

    /// Create a batch job against an injected clock, for tests.
    pub fn with_clock(
        forge: Arc<dyn ForgeClient>,
        git: GitWorkingCopy,
        options: MergeJobOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            forge,
            git,
            options,
            clock,
        }
    }

    /// Attempt to merge every request in `mrs`, which must all share
    /// `target_branch` and be given oldest-first.
    pub fn run(
        &self,
        project_id: ProjectId,
        target_branch: &str,
        mrs: &[MergeRequest],
    ) -> Result<BatchOutcome, JobError> {
        let fuse_strategy = match self.options.merge_strategy {
            MergeStrategy::Rebase => FuseStrategy::Rebase,
            MergeStrategy::RebaseThenMerge => FuseStrategy::RebaseThenMerge,
            MergeStrategy::Merge => return Err(JobError::fatal("batch jobs cannot use the Merge strategy")),
        };

        let target_ref = format!("origin/{}", target_branch);
        self.git
            .create_branch(STAGING_BRANCH, &target_ref)
            .map_err(|err| JobError::fatal(format!("failed to create staging branch: {}", err)))?;
        self.git
            .checkout_branch(STAGING_BRANCH)
            .map_err(|err| JobError::fatal(format!("failed to check out staging branch: {}", err)))?;

        let mut merged = Vec::new();

        for (idx, mr) in mrs.iter().enumerate() {
            let fused = self
                .git
                .fetch("origin", &mr.source_branch)
                .and_then(|()| self.git.fuse(fuse_strategy, &mr.source_branch, STAGING_BRANCH))
                .and_then(|tip| {
                    self.git.create_branch(STAGING_BRANCH, tip.as_str())?;
                    Ok(())
                });

            if let Err(err) = fused {
                return Ok(BatchOutcome::PartialFailure {
                    merged,
                    failed_iid: mr.iid,
                    reason: format!("failed to fuse onto the batch: {}", err),
                    deferred: mrs[idx + 1..].iter().map(|mr| mr.iid).collect(),
                });
            }
        }

        let tip = match self.git.commit_hash(STAGING_BRANCH) {
            Ok(tip) => tip,
            Err(err) => {
                return Ok(BatchOutcome::PartialFailure {
                    merged,
                    failed_iid: mrs.first().map(|mr| mr.iid).unwrap_or_default(),
                    reason: format!("failed to resolve the batch tip: {}", err),
                    deferred: mrs.iter().map(|mr| mr.iid).collect(),
                });
            },
        };

        if let Err(err) = self.git.push("origin", STAGING_BRANCH) {
            return Ok(BatchOutcome::PartialFailure {
                merged,
                failed_iid: mrs.first().map(|mr| mr.iid).unwrap_or_default(),
                reason: format!("failed to push the batch branch: {}", err),
                deferred: mrs.iter().map(|mr| mr.iid).collect(),
            });
        }

        if let Err(reason) = self.await_batch_ci(project_id, &tip) {
            return Ok(BatchOutcome::PartialFailure {
                merged,
                failed_iid: mrs.first().map(|mr| mr.iid).unwrap_or_default(),
                reason,
                deferred: mrs.iter().map(|mr| mr.iid).collect(),
            });
        }

        for mr in mrs {
            match self.forge.accept_merge_request(project_id, mr.iid, None) {
                Ok(()) => merged.push(mr.iid),
                Err(err) => {
                    warn!(target: "mergebot/batch", "failed to accept !{}: {}", mr.iid, err);
                    return Ok(BatchOutcome::PartialFailure {
                        merged,
                        failed_iid: mr.iid,
                        reason: format!("forge refused to merge: {}", err),
                        deferred: Vec::new(),
                    });
                },
            }
        }

        info!(target: "mergebot/batch", "batch of {} merge requests landed", merged.len());

        Ok(BatchOutcome::Success(merged))
    }

    /// Poll pipelines on the staging branch until one matching `tip`
    /// completes, mirroring `MergeJob::await_ci`'s status handling and
    /// deadline but over `STAGING_BRANCH` instead of a single MR's source.
    fn await_batch_ci(&self, project_id: ProjectId, tip: &git_workarea::CommitId) -> Result<(), String> {
        let deadline = match chrono::Duration::from_std(self.options.ci_timeout) {
            Ok(timeout) => self.clock.now() + timeout,
            Err(_) => return Err("invalid ci_timeout".to_owned()),
        };
        let mut started_ours = false;

        loop {
            let pipelines = self
                .forge
                .pipelines_for_branch(project_id, STAGING_BRANCH)
                .map_err(|err| format!("failed to list batch pipelines: {}", err))?;
            let matching = pipelines.iter().find(|pipeline| &pipeline.sha == tip);

            match matching.map(|pipeline| pipeline.status) {
                Some(PipelineStatus::Success) | Some(PipelineStatus::Skipped) => return Ok(()),
                Some(PipelineStatus::Failed) => return Err("batch CI failed".to_owned()),
                Some(PipelineStatus::Canceled) => {
                    return Err("someone canceled the batch CI".to_owned())
                },
                Some(PipelineStatus::Pending)
                | Some(PipelineStatus::Running)
                | Some(PipelineStatus::Created) => {},
                None if self.options.require_ci_run_by_me && !started_ours => {
                    self.forge
                        .start_pipeline(project_id, STAGING_BRANCH, None)
                        .map_err(|err| format!("failed to start batch CI: {}", err))?;
                    started_ours = true;
                },
                None => {
                    warn!(target: "mergebot/batch", "no pipeline found yet for batch onto {}", STAGING_BRANCH);
                },
            }

            if self.clock.now() >= deadline {
                return Err("batch CI is taking too long".to_owned());
            }

            if self.clock.cancelled() {
                return Err("terminating".to_owned());
            }

            self.clock.sleep(CI_POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use git_workarea::GitContext;

    use crate::forge::{ForgeResult, MergeRequest, Pipeline, Project, User, UserId};
    use crate::trailers::TrailerToggles;

    use super::*;

    /// A forge double that panics on any call; the rejection under test
    /// happens before `BatchJob::run` ever reaches the forge or Git.
    struct UnreachableForge;

    impl ForgeClient for UnreachableForge {
        fn myself(&self) -> ForgeResult<User> {
            unreachable!()
        }
        fn user(&self, _id: UserId) -> ForgeResult<User> {
            unreachable!()
        }
        fn project(&self, _id: ProjectId) -> ForgeResult<Project> {
            unreachable!()
        }
        fn list_projects(&self) -> ForgeResult<Vec<Project>> {
            unreachable!()
        }
        fn merge_requests_assigned_to(
            &self,
            _project: ProjectId,
            _user: UserId,
        ) -> ForgeResult<Vec<MergeRequest>> {
            unreachable!()
        }
        fn refetch_merge_request(&self, _project: ProjectId, _iid: u64) -> ForgeResult<MergeRequest> {
            unreachable!()
        }
        fn approvals(&self, _project: ProjectId, _iid: u64) -> ForgeResult<crate::forge::Approvals> {
            unreachable!()
        }
        fn reapprove(&self, _project: ProjectId, _iid: u64) -> ForgeResult<()> {
            unreachable!()
        }
        fn assign(&self, _project: ProjectId, _iid: u64, _user: UserId) -> ForgeResult<()> {
            unreachable!()
        }
        fn unassign(&self, _project: ProjectId, _iid: u64) -> ForgeResult<()> {
            unreachable!()
        }
        fn post_comment(&self, _project: ProjectId, _iid: u64, _body: &str) -> ForgeResult<()> {
            unreachable!()
        }
        fn accept_merge_request(
            &self,
            _project: ProjectId,
            _iid: u64,
            _commit_message: Option<&str>,
        ) -> ForgeResult<()> {
            unreachable!()
        }
        fn branch(&self, _project: ProjectId, _name: &str) -> ForgeResult<crate::forge::Branch> {
            unreachable!()
        }
        fn pipelines_for_branch(
            &self,
            _project: ProjectId,
            _branch: &str,
        ) -> ForgeResult<Vec<Pipeline>> {
            unreachable!()
        }
        fn start_pipeline(
            &self,
            _project: ProjectId,
            _branch: &str,
            _user: Option<&str>,
        ) -> ForgeResult<Pipeline> {
            unreachable!()
        }
    }

    fn options_with_strategy(merge_strategy: MergeStrategy) -> MergeJobOptions {
        MergeJobOptions {
            trailers: TrailerToggles::default(),
            reapprove: false,
            approval_timeout: Duration::from_secs(0),
            embargo: crate::embargo::IntervalUnion::none(),
            ci_timeout: Duration::from_secs(60),
            ci_timeout_skip: false,
            merge_strategy,
            require_ci_run_by_me: false,
        }
    }

    #[test]
    fn test_batch_rejects_merge_strategy_before_touching_git_or_forge() {
        let forge: Arc<dyn ForgeClient> = Arc::new(UnreachableForge);
        let git = GitWorkingCopy::new(GitContext::new(std::env::temp_dir()), Duration::from_secs(5));
        let batch = BatchJob::new(forge, git, options_with_strategy(MergeStrategy::Merge));

        let err = batch.run(ProjectId(1), "main", &[]).unwrap_err();
        assert!(matches!(err, JobError::Fatal { .. }));
    }

    /// A forge double exposing only pipeline listing/starting, for exercising
    /// `await_batch_ci` without a real Git repository.
    #[derive(Default)]
    struct PipelineOnlyForge {
        pipelines: std::sync::Mutex<Vec<Pipeline>>,
        start_calls: std::sync::Mutex<u32>,
    }

    impl ForgeClient for PipelineOnlyForge {
        fn myself(&self) -> ForgeResult<User> {
            unreachable!()
        }
        fn user(&self, _id: UserId) -> ForgeResult<User> {
            unreachable!()
        }
        fn project(&self, _id: ProjectId) -> ForgeResult<Project> {
            unreachable!()
        }
        fn list_projects(&self) -> ForgeResult<Vec<Project>> {
            unreachable!()
        }
        fn merge_requests_assigned_to(
            &self,
            _project: ProjectId,
            _user: UserId,
        ) -> ForgeResult<Vec<MergeRequest>> {
            unreachable!()
        }
        fn refetch_merge_request(&self, _project: ProjectId, _iid: u64) -> ForgeResult<MergeRequest> {
            unreachable!()
        }
        fn approvals(&self, _project: ProjectId, _iid: u64) -> ForgeResult<crate::forge::Approvals> {
            unreachable!()
        }
        fn reapprove(&self, _project: ProjectId, _iid: u64) -> ForgeResult<()> {
            unreachable!()
        }
        fn assign(&self, _project: ProjectId, _iid: u64, _user: UserId) -> ForgeResult<()> {
            unreachable!()
        }
        fn unassign(&self, _project: ProjectId, _iid: u64) -> ForgeResult<()> {
            unreachable!()
        }
        fn post_comment(&self, _project: ProjectId, _iid: u64, _body: &str) -> ForgeResult<()> {
            unreachable!()
        }
        fn accept_merge_request(
            &self,
            _project: ProjectId,
            _iid: u64,
            _commit_message: Option<&str>,
        ) -> ForgeResult<()> {
            unreachable!()
        }
        fn branch(&self, _project: ProjectId, _name: &str) -> ForgeResult<crate::forge::Branch> {
            unreachable!()
        }
        fn pipelines_for_branch(
            &self,
            _project: ProjectId,
            _branch: &str,
        ) -> ForgeResult<Vec<Pipeline>> {
            Ok(self.pipelines.lock().unwrap().clone())
        }
        fn start_pipeline(
            &self,
            project: ProjectId,
            branch: &str,
            _user: Option<&str>,
        ) -> ForgeResult<Pipeline> {
            *self.start_calls.lock().unwrap() += 1;
            Ok(Pipeline {
                project_id: project,
                branch: branch.to_owned(),
                sha: git_workarea::CommitId::new("deadbeef".to_owned()),
                status: crate::forge::PipelineStatus::Pending,
                id: 1,
                user: Some("mergebot".to_owned()),
            })
        }
    }

    /// A clock that advances only when `sleep` is called, mirroring
    /// `job::test::FakeClock`.
    struct FakeClock {
        now: std::sync::Mutex<chrono::DateTime<chrono::Utc>>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                now: std::sync::Mutex::new(
                    chrono::TimeZone::with_ymd_and_hms(&chrono::Utc, 2026, 1, 1, 0, 0, 0).unwrap(),
                ),
            }
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> chrono::DateTime<chrono::Utc> {
            *self.now.lock().unwrap()
        }

        fn sleep(&self, duration: Duration) {
            let mut now = self.now.lock().unwrap();
            *now = *now + chrono::Duration::from_std(duration).unwrap();
        }
    }

    fn batch_job_with(
        forge: PipelineOnlyForge,
        options: MergeJobOptions,
        clock: FakeClock,
    ) -> (BatchJob, Arc<PipelineOnlyForge>) {
        let forge = Arc::new(forge);
        let git = GitWorkingCopy::new(GitContext::new(std::env::temp_dir()), Duration::from_secs(5));
        let batch = BatchJob::with_clock(
            Arc::clone(&forge) as Arc<dyn ForgeClient>,
            git,
            options,
            Arc::new(clock),
        );
        (batch, forge)
    }

    #[test]
    fn test_await_batch_ci_succeeds_on_matching_success() {
        let forge = PipelineOnlyForge::default();
        let tip = git_workarea::CommitId::new("cafef00d".to_owned());
        *forge.pipelines.lock().unwrap() = vec![Pipeline {
            project_id: ProjectId(1),
            branch: STAGING_BRANCH.to_owned(),
            sha: tip.clone(),
            status: crate::forge::PipelineStatus::Success,
            id: 1,
            user: None,
        }];
        let (batch, _forge) =
            batch_job_with(forge, options_with_strategy(MergeStrategy::Rebase), FakeClock::new());

        batch
            .await_batch_ci(ProjectId(1), &tip)
            .expect("CI succeeded");
    }

    #[test]
    fn test_await_batch_ci_fails_on_failed_pipeline() {
        let forge = PipelineOnlyForge::default();
        let tip = git_workarea::CommitId::new("cafef00d".to_owned());
        *forge.pipelines.lock().unwrap() = vec![Pipeline {
            project_id: ProjectId(1),
            branch: STAGING_BRANCH.to_owned(),
            sha: tip.clone(),
            status: crate::forge::PipelineStatus::Failed,
            id: 1,
            user: None,
        }];
        let (batch, _forge) =
            batch_job_with(forge, options_with_strategy(MergeStrategy::Rebase), FakeClock::new());

        let err = batch.await_batch_ci(ProjectId(1), &tip).unwrap_err();
        assert!(err.contains("failed"));
    }

    #[test]
    fn test_await_batch_ci_times_out() {
        let forge = PipelineOnlyForge::default();
        let tip = git_workarea::CommitId::new("cafef00d".to_owned());
        let mut options = options_with_strategy(MergeStrategy::Rebase);
        options.ci_timeout = Duration::from_secs(5);
        let (batch, _forge) = batch_job_with(forge, options, FakeClock::new());

        let err = batch.await_batch_ci(ProjectId(1), &tip).unwrap_err();
        assert!(err.contains("too long"));
    }

    #[test]
    fn test_await_batch_ci_starts_pipeline_once_when_required() {
        let forge = PipelineOnlyForge::default();
        let tip = git_workarea::CommitId::new("cafef00d".to_owned());
        let mut options = options_with_strategy(MergeStrategy::Rebase);
        options.ci_timeout = Duration::from_secs(5);
        options.require_ci_run_by_me = true;
        let (batch, forge) = batch_job_with(forge, options, FakeClock::new());

        let _ = batch.await_batch_ci(ProjectId(1), &tip);
        assert_eq!(*forge.start_calls.lock().unwrap(), 1);
    }
}
