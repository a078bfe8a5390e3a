//! A [`ForgeClient`](mergebot::forge::ForgeClient) binding for GitLab.
//!
//! Adapts the `gitlab` crate's typed REST endpoints (`gitlab::api::Query`)
//! into `mergebot`'s forge vocabulary: this layer owns every bit of
//! GitLab-specific naming and status mapping so the job, scheduler, and
//! batch layers never see raw GitLab JSON shapes.

use std::collections::HashMap;
use std::sync::Mutex;

use git_workarea::CommitId;
use log::warn;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use gitlab;

use gitlab::api::{self, Query};

use mergebot::forge::{
    Approvals, Branch, ForgeClient, ForgeError, ForgeResult, MergeRequest, MergeRequestState,
    Pipeline, PipelineStatus, Project, ProjectId, User, UserId,
};

mod types;

fn forge_user(user: types::FullUser) -> User {
    User {
        id: UserId(user.id),
        username: user.username,
        name: user.name,
        email: user.email,
    }
}

fn forge_project(project: types::Project) -> Project {
    Project {
        id: ProjectId(project.id),
        ssh_url_to_repo: project.ssh_url_to_repo,
        only_allow_merge_if_pipeline_succeeds: project.only_allow_merge_if_pipeline_succeeds,
        only_allow_merge_if_all_discussions_are_resolved: project
            .only_allow_merge_if_all_discussions_are_resolved,
    }
}

fn forge_branch(project_id: ProjectId, branch: types::Branch) -> Branch {
    Branch {
        project_id,
        name: branch.name,
        protected: branch.protected,
    }
}

fn forge_mr_state(state: types::MergeRequestState) -> MergeRequestState {
    match state {
        types::MergeRequestState::Opened => MergeRequestState::Opened,
        types::MergeRequestState::Reopened => MergeRequestState::Reopened,
        types::MergeRequestState::Locked => MergeRequestState::Locked,
        types::MergeRequestState::Merged => MergeRequestState::Merged,
        types::MergeRequestState::Closed => MergeRequestState::Closed,
    }
}

fn forge_merge_request(mr: types::MergeRequest) -> MergeRequest {
    MergeRequest {
        project_id: ProjectId(mr.project_id),
        iid: mr.iid,
        state: forge_mr_state(mr.state),
        work_in_progress: mr.work_in_progress,
        squash: mr.squash,
        source_project_id: ProjectId(mr.source_project_id),
        source_branch: mr.source_branch,
        target_branch: mr.target_branch,
        sha: CommitId::new(mr.sha.unwrap_or_default()),
        assignee_ids: mr.assignees.into_iter().map(|user| UserId(user.id)).collect(),
        author_id: UserId(mr.author.id),
        labels: mr.labels,
        web_url: mr.web_url,
        description: mr.description.unwrap_or_default(),
        updated_at: mr.updated_at,
    }
}

fn forge_approvals(approvals: types::Approvals) -> Approvals {
    Approvals {
        approver_ids: approvals
            .approved_by
            .into_iter()
            .map(|approved_by| UserId(approved_by.user.id))
            .collect(),
        approvals_left: approvals.approvals_left,
    }
}

fn forge_pipeline_status(status: types::PipelineStatus) -> PipelineStatus {
    match status {
        types::PipelineStatus::Created => PipelineStatus::Created,
        types::PipelineStatus::Pending | types::PipelineStatus::Scheduled => {
            PipelineStatus::Pending
        },
        types::PipelineStatus::Running => PipelineStatus::Running,
        types::PipelineStatus::Success => PipelineStatus::Success,
        types::PipelineStatus::Failed => PipelineStatus::Failed,
        types::PipelineStatus::Canceled => PipelineStatus::Canceled,
        types::PipelineStatus::Skipped | types::PipelineStatus::Manual => PipelineStatus::Skipped,
    }
}

fn forge_pipeline(project_id: ProjectId, branch: &str, pipeline: types::Pipeline) -> Pipeline {
    Pipeline {
        project_id,
        branch: branch.to_string(),
        sha: CommitId::new(pipeline.sha),
        status: forge_pipeline_status(pipeline.status),
        id: pipeline.id,
        user: pipeline.user.map(|user| user.username),
    }
}

/// Errors specific to the GitLab binding, folded into [`ForgeError`] at the
/// trait boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
enum GitlabForgeError {
    /// No prior approvers are on record to reapprove on behalf of.
    #[error("no prior approvers recorded for merge request {}", iid)]
    NoPriorApprovers {
        /// The merge request's project-scoped id.
        iid: u64,
    },
}

/// A [`ForgeClient`] implemented against a live GitLab instance.
///
/// Holds a small in-memory cache of the last sufficient approver set seen
/// per merge request, since GitLab's approvals endpoint only reports the
/// *current* state: after a force-push resets approvals there is nothing
/// left in the API response to re-approve on behalf of unless the binding
/// remembered it first.
pub struct GitlabForge {
    gitlab: gitlab::Gitlab,
    last_approvers: Mutex<HashMap<(u64, u64), Vec<u64>>>,
}

impl GitlabForge {
    /// Wrap an already-constructed `gitlab::Gitlab` client.
    pub fn new(gitlab: gitlab::Gitlab) -> Self {
        Self {
            gitlab,
            last_approvers: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying `gitlab` crate client, for diagnostics.
    pub fn gitlab(&self) -> &gitlab::Gitlab {
        &self.gitlab
    }

    fn query<E, T>(&self, endpoint: &E) -> ForgeResult<T>
    where
        E: api::Query<T, gitlab::Gitlab>,
        T: DeserializeOwned,
    {
        endpoint.query(&self.gitlab).map_err(ForgeError::api)
    }

    fn remember_approvers(&self, project: ProjectId, iid: u64, approvals: &Approvals) {
        if !approvals.sufficient() {
            return;
        }
        let ids = approvals.approver_ids.iter().map(|id| id.0).collect();
        self.last_approvers
            .lock()
            .expect("approver cache poisoned")
            .insert((project.0, iid), ids);
    }
}

impl ForgeClient for GitlabForge {
    fn myself(&self) -> ForgeResult<User> {
        let endpoint = api::users::CurrentUser::builder()
            .build()
            .expect("CurrentUser takes no required fields");
        let user: types::FullUser = self.query(&endpoint)?;
        Ok(forge_user(user))
    }

    fn user(&self, id: UserId) -> ForgeResult<User> {
        let endpoint = api::users::User::builder()
            .user(id.0)
            .build()
            .expect("user id is the only required field");
        let user: types::FullUser = self.query(&endpoint)?;
        Ok(forge_user(user))
    }

    fn project(&self, id: ProjectId) -> ForgeResult<Project> {
        let endpoint = api::projects::Project::builder()
            .project(id.0)
            .build()
            .expect("project id is the only required field");
        let project: types::Project = self.query(&endpoint)?;
        Ok(forge_project(project))
    }

    fn list_projects(&self) -> ForgeResult<Vec<Project>> {
        let endpoint = api::projects::Projects::builder()
            .build()
            .expect("Projects takes no required fields");
        let endpoint = api::paged(endpoint, api::Pagination::All);
        let projects: Vec<types::Project> = self.query(&endpoint)?;
        Ok(projects.into_iter().map(forge_project).collect())
    }

    fn merge_requests_assigned_to(
        &self,
        project: ProjectId,
        user: UserId,
    ) -> ForgeResult<Vec<MergeRequest>> {
        let endpoint = api::projects::merge_requests::MergeRequests::builder()
            .project(project.0)
            .assignee_id(api::projects::merge_requests::AssigneeId::Id(user.0))
            .state(api::projects::merge_requests::MergeRequestState::Opened)
            .build()
            .expect("project and assignee are the only required fields");
        let endpoint = api::paged(endpoint, api::Pagination::All);
        let mrs: Vec<types::MergeRequest> = self.query(&endpoint)?;
        Ok(mrs.into_iter().map(forge_merge_request).collect())
    }

    fn refetch_merge_request(&self, project: ProjectId, iid: u64) -> ForgeResult<MergeRequest> {
        let endpoint = api::projects::merge_requests::MergeRequest::builder()
            .project(project.0)
            .merge_request(iid)
            .build()
            .expect("project and iid are the only required fields");
        let mr: types::MergeRequest = self.query(&endpoint)?;
        Ok(forge_merge_request(mr))
    }

    fn approvals(&self, project: ProjectId, iid: u64) -> ForgeResult<Approvals> {
        let endpoint = api::projects::merge_requests::approvals::MergeRequestApprovals::builder()
            .project(project.0)
            .merge_request(iid)
            .build()
            .expect("project and iid are the only required fields");
        let approvals: types::Approvals = self.query(&endpoint)?;
        let approvals = forge_approvals(approvals);
        self.remember_approvers(project, iid, &approvals);
        Ok(approvals)
    }

    fn reapprove(&self, project: ProjectId, iid: u64) -> ForgeResult<()> {
        let approvers = self
            .last_approvers
            .lock()
            .expect("approver cache poisoned")
            .get(&(project.0, iid))
            .cloned()
            .ok_or_else(|| ForgeError::api(GitlabForgeError::NoPriorApprovers { iid }))?;

        for approver in approvers {
            let endpoint = api::projects::merge_requests::approvals::ApproveMergeRequest::builder(
            )
            .project(project.0)
            .merge_request(iid)
            .build()
            .expect("project and iid are the only required fields");
            let approve_as_user = api::users::User::builder()
                .user(approver)
                .build()
                .expect("user id is the only required field");
            let username: types::FullUser = self.query(&approve_as_user)?;
            let endpoint = api::sudo(endpoint, username.username);
            let endpoint = api::ignore(endpoint);
            self.query(&endpoint)?;
        }

        Ok(())
    }

    fn assign(&self, project: ProjectId, iid: u64, user: UserId) -> ForgeResult<()> {
        let endpoint = api::projects::merge_requests::EditMergeRequest::builder()
            .project(project.0)
            .merge_request(iid)
            .assignee_ids(std::iter::once(user.0))
            .build()
            .expect("project, iid, and assignee are the only required fields");
        let endpoint = api::ignore(endpoint);
        self.query(&endpoint)
    }

    fn unassign(&self, project: ProjectId, iid: u64) -> ForgeResult<()> {
        let endpoint = api::projects::merge_requests::EditMergeRequest::builder()
            .project(project.0)
            .merge_request(iid)
            .assignee_ids(std::iter::empty::<u64>())
            .build()
            .expect("project and iid are the only required fields");
        let endpoint = api::ignore(endpoint);
        self.query(&endpoint)
    }

    fn post_comment(&self, project: ProjectId, iid: u64, body: &str) -> ForgeResult<()> {
        let endpoint = api::projects::merge_requests::notes::CreateMergeRequestNote::builder()
            .project(project.0)
            .merge_request(iid)
            .body(body)
            .build()
            .expect("project, iid, and body are the only required fields");
        let endpoint = api::ignore(endpoint);
        self.query(&endpoint)
    }

    fn accept_merge_request(
        &self,
        project: ProjectId,
        iid: u64,
        commit_message: Option<&str>,
    ) -> ForgeResult<()> {
        let mut endpoint = api::projects::merge_requests::MergeMergeRequest::builder();
        endpoint.project(project.0).merge_request(iid);
        if let Some(message) = commit_message {
            endpoint.merge_commit_message(message);
        }
        let endpoint = endpoint
            .build()
            .expect("project and iid are the only required fields");
        let endpoint = api::ignore(endpoint);
        self.query(&endpoint)
    }

    fn branch(&self, project: ProjectId, name: &str) -> ForgeResult<Branch> {
        let endpoint = api::projects::repository::branches::Branch::builder()
            .project(project.0)
            .branch(name)
            .build()
            .expect("project and branch name are the only required fields");
        let branch: types::Branch = self.query(&endpoint)?;
        Ok(forge_branch(project, branch))
    }

    fn pipelines_for_branch(&self, project: ProjectId, branch: &str) -> ForgeResult<Vec<Pipeline>> {
        let endpoint = api::projects::pipelines::Pipelines::builder()
            .project(project.0)
            .ref_(branch)
            .build()
            .expect("project and branch are the only required fields");
        let endpoint = api::paged(endpoint, api::Pagination::All);
        let pipelines: Vec<types::Pipeline> = self.query(&endpoint)?;
        Ok(pipelines
            .into_iter()
            .map(|pipeline| forge_pipeline(project, branch, pipeline))
            .collect())
    }

    fn start_pipeline(
        &self,
        project: ProjectId,
        branch: &str,
        user: Option<&str>,
    ) -> ForgeResult<Pipeline> {
        let endpoint = api::projects::pipelines::CreatePipeline::builder()
            .project(project.0)
            .ref_(branch)
            .build()
            .expect("project and branch are the only required fields");

        let pipeline: types::Pipeline = if let Some(user) = user {
            let endpoint = api::sudo(endpoint, user);
            self.query(&endpoint)?
        } else {
            self.query(&endpoint)?
        };

        if pipeline.user.is_none() {
            warn!(
                target: "mergebot-gitlab",
                "pipeline {} on {} has no attributed user", pipeline.id, branch,
            );
        }

        Ok(forge_pipeline(project, branch, pipeline))
    }
}
