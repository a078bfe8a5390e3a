//! Ordering and dispatch of merge requests within a project.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use regex::Regex;

use crate::forge::{ForgeClient, MergeRequest, Project, UserId};
use crate::job::{JobError, JobOutcome, MergeJob};

/// Picks which merge requests to work on, in which order, for one project.
///
/// Ordering rule (see the merge job's options for what governs a single
/// job): merge requests carrying every label in `priority_labels` first,
/// then ascending `updated_at` within each group.
pub struct Scheduler {
    forge: Arc<dyn ForgeClient>,
    self_user: UserId,
    priority_labels: Vec<String>,
    branch_regexp: Option<Regex>,
    skip_pending: bool,
    cancel: Arc<AtomicBool>,
}

impl Scheduler {
    /// Create a scheduler for the bot identified by `self_user`.
    pub fn new(forge: Arc<dyn ForgeClient>, self_user: UserId) -> Self {
        Self {
            forge,
            self_user,
            priority_labels: Vec::new(),
            branch_regexp: None,
            skip_pending: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a termination flag with the outer polling loop; `dispatch`
    /// stops advancing to the next merge request once it is set.
    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Require every merge request to have all of these labels to jump the
    /// queue ahead of requests lacking any of them.
    pub fn with_priority_labels<I>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.priority_labels = labels.into_iter().collect();
        self
    }

    /// Only consider merge requests whose target branch matches `regexp`.
    pub fn with_branch_regexp(mut self, regexp: Regex) -> Self {
        self.branch_regexp = Some(regexp);
        self
    }

    /// Advance past a merge request that isn't processable yet instead of
    /// blocking the rest of the project's queue on it.
    pub fn with_skip_pending(mut self, skip_pending: bool) -> Self {
        self.skip_pending = skip_pending;
        self
    }

    /// List and order the merge requests eligible for processing in
    /// `project`, per the rule documented on `Scheduler`.
    pub fn eligible_merge_requests(
        &self,
        project: &Project,
    ) -> Result<Vec<MergeRequest>, JobError> {
        let mut mrs = self
            .forge
            .merge_requests_assigned_to(project.id, self.self_user)?;

        if let Some(ref regexp) = self.branch_regexp {
            mrs.retain(|mr| regexp.is_match(&mr.target_branch));
        }

        mrs.sort_by(|a, b| {
            let a_priority = self.has_priority(a);
            let b_priority = self.has_priority(b);
            b_priority
                .cmp(&a_priority)
                .then_with(|| a.updated_at.cmp(&b.updated_at))
        });

        Ok(mrs)
    }

    fn has_priority(&self, mr: &MergeRequest) -> bool {
        !self.priority_labels.is_empty()
            && self
                .priority_labels
                .iter()
                .all(|label| mr.labels.iter().any(|mr_label| mr_label == label))
    }

    /// Run a single already-constructed job against each eligible merge
    /// request of `project`, stopping on the first merge request that isn't
    /// processable when `skip_pending` is unset.
    pub fn dispatch(&self, project: &Project, job: &MergeJob) {
        let mrs = match self.eligible_merge_requests(project) {
            Ok(mrs) => mrs,
            Err(err) => {
                warn!(target: "mergebot/scheduler", "failed to list merge requests for {}: {}", project.id, err);
                return;
            },
        };

        for mr in mrs {
            if self.cancel.load(Ordering::SeqCst) {
                info!(target: "mergebot/scheduler", "stopping before !{}: termination requested", mr.iid);
                return;
            }

            match job.run(project.id, mr.iid) {
                Ok(JobOutcome::Success) => {
                    info!(target: "mergebot/scheduler", "merged !{}", mr.iid);
                },
                Ok(JobOutcome::Skipped(reason)) => {
                    info!(target: "mergebot/scheduler", "skipped !{}: {}", mr.iid, reason);
                    if !self.skip_pending {
                        break;
                    }
                },
                Err(err) => {
                    warn!(target: "mergebot/scheduler", "!{} failed: {}", mr.iid, err);
                    if let Err(post_err) =
                        self.forge.post_comment(project.id, mr.iid, &err.to_string())
                    {
                        warn!(target: "mergebot/scheduler", "failed to comment on !{}: {}", mr.iid, post_err);
                    }
                },
            }
        }
    }

    /// List every project matching `project_regexp`, for the outer loop.
    pub fn matching_projects(&self, project_regexp: &Regex) -> Result<Vec<Project>, JobError> {
        let mut projects = self.forge.list_projects()?;
        projects.retain(|project| project_regexp.is_match(&project.ssh_url_to_repo));
        Ok(projects)
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Utc};
    use git_workarea::CommitId;

    use crate::forge::{
        Approvals, Branch, ForgeResult, MergeRequestState, Pipeline, ProjectId, UserId,
    };

    use super::*;

    /// A forge double exposing only what `Scheduler` reads: merge requests
    /// and projects. Every other operation is unreachable from these tests.
    struct ListOnlyForge {
        mrs: Vec<MergeRequest>,
    }

    impl ForgeClient for ListOnlyForge {
        fn myself(&self) -> ForgeResult<crate::forge::User> {
            unimplemented!("not exercised by the scheduler")
        }

        fn user(&self, _id: UserId) -> ForgeResult<crate::forge::User> {
            unimplemented!("not exercised by the scheduler")
        }

        fn project(&self, _id: ProjectId) -> ForgeResult<Project> {
            unimplemented!("not exercised by the scheduler")
        }

        fn list_projects(&self) -> ForgeResult<Vec<Project>> {
            unimplemented!("not exercised by these tests")
        }

        fn merge_requests_assigned_to(
            &self,
            _project: ProjectId,
            _user: UserId,
        ) -> ForgeResult<Vec<MergeRequest>> {
            Ok(self.mrs.clone())
        }

        fn refetch_merge_request(&self, _project: ProjectId, _iid: u64) -> ForgeResult<MergeRequest> {
            unimplemented!("not exercised by the scheduler")
        }

        fn approvals(&self, _project: ProjectId, _iid: u64) -> ForgeResult<Approvals> {
            unimplemented!("not exercised by the scheduler")
        }

        fn reapprove(&self, _project: ProjectId, _iid: u64) -> ForgeResult<()> {
            unimplemented!("not exercised by the scheduler")
        }

        fn assign(&self, _project: ProjectId, _iid: u64, _user: UserId) -> ForgeResult<()> {
            unimplemented!("not exercised by the scheduler")
        }

        fn unassign(&self, _project: ProjectId, _iid: u64) -> ForgeResult<()> {
            unimplemented!("not exercised by the scheduler")
        }

        fn post_comment(&self, _project: ProjectId, _iid: u64, _body: &str) -> ForgeResult<()> {
            Ok(())
        }

        fn accept_merge_request(
            &self,
            _project: ProjectId,
            _iid: u64,
            _commit_message: Option<&str>,
        ) -> ForgeResult<()> {
            unimplemented!("not exercised by the scheduler")
        }

        fn branch(&self, _project: ProjectId, _name: &str) -> ForgeResult<Branch> {
            unimplemented!("not exercised by the scheduler")
        }

        fn pipelines_for_branch(
            &self,
            _project: ProjectId,
            _branch: &str,
        ) -> ForgeResult<Vec<Pipeline>> {
            unimplemented!("not exercised by the scheduler")
        }

        fn start_pipeline(
            &self,
            _project: ProjectId,
            _branch: &str,
            _user: Option<&str>,
        ) -> ForgeResult<Pipeline> {
            unimplemented!("not exercised by the scheduler")
        }
    }

    fn mr(iid: u64, labels: &[&str], updated_at: chrono::DateTime<Utc>) -> MergeRequest {
        MergeRequest {
            project_id: ProjectId(1),
            iid,
            state: MergeRequestState::Opened,
            work_in_progress: false,
            squash: false,
            source_project_id: ProjectId(1),
            source_branch: format!("feature/{}", iid),
            target_branch: "main".to_owned(),
            sha: CommitId::new("cafebabe".to_owned()),
            assignee_ids: vec![UserId(1)],
            author_id: UserId(2),
            labels: labels.iter().map(|label| (*label).to_owned()).collect(),
            web_url: format!("https://gitlab.example.com/group/project/-/merge_requests/{}", iid),
            description: String::new(),
            updated_at,
        }
    }

    fn project() -> Project {
        Project {
            id: ProjectId(1),
            ssh_url_to_repo: "git@example.com:group/project.git".to_owned(),
            only_allow_merge_if_pipeline_succeeds: false,
            only_allow_merge_if_all_discussions_are_resolved: false,
        }
    }

    fn at(day: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_orders_oldest_first_within_a_group() {
        let mrs = vec![mr(1, &[], at(3)), mr(2, &[], at(1)), mr(3, &[], at(2))];
        let forge: Arc<dyn ForgeClient> = Arc::new(ListOnlyForge { mrs });
        let scheduler = Scheduler::new(forge, UserId(1));

        let ordered = scheduler.eligible_merge_requests(&project()).unwrap();
        let iids: Vec<u64> = ordered.iter().map(|mr| mr.iid).collect();
        assert_eq!(iids, vec![2, 3, 1]);
    }

    #[test]
    fn test_priority_labels_jump_the_queue() {
        let mrs = vec![
            mr(1, &[], at(1)),
            mr(2, &["hotfix", "urgent"], at(3)),
            mr(3, &["hotfix"], at(2)),
        ];
        let forge: Arc<dyn ForgeClient> = Arc::new(ListOnlyForge { mrs });
        let scheduler =
            Scheduler::new(forge, UserId(1)).with_priority_labels(["hotfix".to_owned(), "urgent".to_owned()]);

        let ordered = scheduler.eligible_merge_requests(&project()).unwrap();
        let iids: Vec<u64> = ordered.iter().map(|mr| mr.iid).collect();
        // Only !2 carries every priority label, so it jumps ahead even
        // though !3 (partial label match) and !1 are both older.
        assert_eq!(iids, vec![2, 3, 1]);
    }

    #[test]
    fn test_branch_regexp_filters_targets() {
        let mut off_target = mr(1, &[], at(1));
        off_target.target_branch = "release/1.0".to_owned();
        let mrs = vec![off_target, mr(2, &[], at(2))];
        let forge: Arc<dyn ForgeClient> = Arc::new(ListOnlyForge { mrs });
        let scheduler =
            Scheduler::new(forge, UserId(1)).with_branch_regexp(Regex::new("^main$").unwrap());

        let ordered = scheduler.eligible_merge_requests(&project()).unwrap();
        let iids: Vec<u64> = ordered.iter().map(|mr| mr.iid).collect();
        assert_eq!(iids, vec![2]);
    }
}
