//! The trait a forge binding implements.

use std::error::Error as StdError;

use thiserror::Error;

use super::types::{
    Approvals, Branch, MergeRequest, Pipeline, Project, ProjectId, User, UserId,
};

/// Errors a forge binding may report.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ForgeError {
    /// The forge's API returned an error.
    #[error("forge API error: {}", source)]
    Api {
        /// The underlying error.
        source: Box<dyn StdError + Send + Sync>,
    },
    /// The request referred to something the forge doesn't know about.
    #[error("no such {} {}", kind, id)]
    NotFound {
        /// What kind of object was requested (project, merge request, user, ...).
        kind: &'static str,
        /// The id that was requested.
        id: String,
    },
}

impl ForgeError {
    /// Wrap a transport- or API-level error.
    pub fn api<E>(source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ForgeError::Api {
            source: Box::new(source),
        }
    }

    /// A requested object does not exist.
    pub fn not_found<I>(kind: &'static str, id: I) -> Self
    where
        I: ToString,
    {
        ForgeError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Result type for forge operations.
pub type ForgeResult<T> = Result<T, ForgeError>;

/// The operations the merge job, scheduler, and batch job need from a forge.
///
/// Implemented once per concrete forge (GitLab, ...); the rest of the crate
/// is written entirely against this trait.
pub trait ForgeClient: Send + Sync {
    /// The identity the bot authenticates as.
    fn myself(&self) -> ForgeResult<User>;

    /// Fetch a user by id.
    fn user(&self, id: UserId) -> ForgeResult<User>;

    /// Fetch a project by id.
    fn project(&self, id: ProjectId) -> ForgeResult<Project>;

    /// List every project, for client-side filtering by the scheduler.
    fn list_projects(&self) -> ForgeResult<Vec<Project>>;

    /// List merge requests in `project` currently assigned to `user`.
    fn merge_requests_assigned_to(
        &self,
        project: ProjectId,
        user: UserId,
    ) -> ForgeResult<Vec<MergeRequest>>;

    /// Re-fetch a single merge request's current state.
    fn refetch_merge_request(
        &self,
        project: ProjectId,
        iid: u64,
    ) -> ForgeResult<MergeRequest>;

    /// Fetch a merge request's current approvals.
    fn approvals(&self, project: ProjectId, iid: u64) -> ForgeResult<Approvals>;

    /// Re-approve a merge request on behalf of its prior approvers.
    fn reapprove(&self, project: ProjectId, iid: u64) -> ForgeResult<()>;

    /// Assign a merge request to a user.
    fn assign(&self, project: ProjectId, iid: u64, user: UserId) -> ForgeResult<()>;

    /// Remove every assignee from a merge request.
    fn unassign(&self, project: ProjectId, iid: u64) -> ForgeResult<()>;

    /// Post a comment on a merge request.
    fn post_comment(&self, project: ProjectId, iid: u64, body: &str) -> ForgeResult<()>;

    /// Ask the forge to merge a merge request.
    fn accept_merge_request(
        &self,
        project: ProjectId,
        iid: u64,
        commit_message: Option<&str>,
    ) -> ForgeResult<()>;

    /// Fetch a branch's current state.
    fn branch(&self, project: ProjectId, name: &str) -> ForgeResult<Branch>;

    /// List pipelines for a branch, newest first.
    fn pipelines_for_branch(
        &self,
        project: ProjectId,
        branch: &str,
    ) -> ForgeResult<Vec<Pipeline>>;

    /// Start a new pipeline for a branch, optionally impersonating a user.
    fn start_pipeline(
        &self,
        project: ProjectId,
        branch: &str,
        user: Option<&str>,
    ) -> ForgeResult<Pipeline>;
}
