//! Data types shared by every forge operation.

use std::fmt;

use git_workarea::CommitId;

/// The numeric id of a project on the forge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId(pub u64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The numeric id of a forge user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A forge user.
#[derive(Debug, Clone)]
pub struct User {
    /// The user's id.
    pub id: UserId,
    /// The user's login handle.
    pub username: String,
    /// The user's display name.
    pub name: String,
    /// The user's email, when known.
    pub email: Option<String>,
}

/// A project hosted on the forge.
#[derive(Debug, Clone)]
pub struct Project {
    /// The project's id.
    pub id: ProjectId,
    /// The SSH URL used to fetch and push.
    pub ssh_url_to_repo: String,
    /// Whether the forge refuses to merge unless the pipeline on the merge
    /// request's tip succeeded.
    pub only_allow_merge_if_pipeline_succeeds: bool,
    /// Whether the forge refuses to merge if threads are left unresolved.
    pub only_allow_merge_if_all_discussions_are_resolved: bool,
}

/// A branch on a project.
#[derive(Debug, Clone)]
pub struct Branch {
    /// The project the branch lives on.
    pub project_id: ProjectId,
    /// The branch name.
    pub name: String,
    /// Whether the branch is protected from direct pushes.
    pub protected: bool,
}

/// The lifecycle state of a merge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRequestState {
    /// Open and awaiting action.
    Opened,
    /// Was closed and reopened.
    Reopened,
    /// Locked by the forge (e.g. a merge is in progress).
    Locked,
    /// Already merged.
    Merged,
    /// Closed without merging.
    Closed,
}

/// Approval state of a merge request.
#[derive(Debug, Clone)]
pub struct Approvals {
    /// Users who have approved the current state of the merge request.
    pub approver_ids: Vec<UserId>,
    /// How many more approvals the forge requires before it considers the
    /// merge request mergeable.
    pub approvals_left: u32,
}

impl Approvals {
    /// Whether the forge currently considers this merge request sufficiently
    /// approved.
    pub fn sufficient(&self) -> bool {
        self.approvals_left == 0
    }
}

/// A merge request.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    /// The project the merge request targets.
    pub project_id: ProjectId,
    /// The project-scoped id (as shown in the forge's UI).
    pub iid: u64,
    /// Current lifecycle state.
    pub state: MergeRequestState,
    /// Whether the author has marked this as a work in progress.
    pub work_in_progress: bool,
    /// Whether the forge will squash commits on merge.
    pub squash: bool,
    /// The project commits are fetched from (may differ from `project_id`
    /// when the merge request comes from a fork).
    pub source_project_id: ProjectId,
    /// The branch commits are fetched from.
    pub source_branch: String,
    /// The branch this merge request targets.
    pub target_branch: String,
    /// The tip commit of the source branch as last observed.
    pub sha: CommitId,
    /// Users currently assigned to act on this merge request.
    pub assignee_ids: Vec<UserId>,
    /// The merge request's author.
    pub author_id: UserId,
    /// Labels currently applied.
    pub labels: Vec<String>,
    /// A human-facing URL for the merge request.
    pub web_url: String,
    /// The free-text description, as set by the author.
    pub description: String,
    /// When the merge request was last updated, used for scheduling order.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl MergeRequest {
    /// Whether the given user is currently assigned to this merge request.
    pub fn is_assigned_to(&self, user: UserId) -> bool {
        self.assignee_ids.contains(&user)
    }
}

/// The forge-reported status of a CI pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Just created, not yet scheduled.
    Created,
    /// Waiting for a runner.
    Pending,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Success,
    /// Completed with failures.
    Failed,
    /// Canceled before completion.
    Canceled,
    /// Skipped entirely.
    Skipped,
}

/// A CI pipeline run against a branch.
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// The project the pipeline ran on.
    pub project_id: ProjectId,
    /// The branch the pipeline ran against.
    pub branch: String,
    /// The commit the pipeline ran against.
    pub sha: CommitId,
    /// The pipeline's current status.
    pub status: PipelineStatus,
    /// The forge's id for this pipeline.
    pub id: u64,
    /// The user the pipeline ran as, if reported.
    pub user: Option<String>,
}
