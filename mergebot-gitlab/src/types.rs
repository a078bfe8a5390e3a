//! GitLab's wire shapes for the endpoints `GitlabForge` queries.
//!
//! The `gitlab` crate supplies typed *request* builders, but responses are
//! decoded into small local structs rather than whatever response types the
//! crate itself might expose, so a GitLab API quirk never leaks past this
//! module.

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct FullUser {
    pub id: u64,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserRef {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub struct Project {
    pub id: u64,
    pub ssh_url_to_repo: String,
    #[serde(default)]
    pub only_allow_merge_if_pipeline_succeeds: bool,
    #[serde(default)]
    pub only_allow_merge_if_all_discussions_are_resolved: bool,
}

#[derive(Debug, Deserialize)]
pub struct Branch {
    pub name: String,
    pub protected: bool,
}

/// The subset of GitLab's `state` strings the core's `MergeRequestState`
/// distinguishes; an unrecognized value fails to deserialize rather than
/// being silently folded into one of these, since the core treats "unknown
/// state" as its own rejection (see `job::MergeJob::validate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeRequestState {
    Opened,
    Reopened,
    Locked,
    Merged,
    Closed,
}

#[derive(Debug, Deserialize)]
pub struct MergeRequest {
    pub iid: u64,
    pub project_id: u64,
    pub source_project_id: u64,
    pub source_branch: String,
    pub target_branch: String,
    pub state: MergeRequestState,
    pub work_in_progress: bool,
    #[serde(default)]
    pub squash: bool,
    /// Null on a merge request whose source branch has no commits yet.
    pub sha: Option<String>,
    #[serde(default)]
    pub assignees: Vec<UserRef>,
    pub author: UserRef,
    #[serde(default)]
    pub labels: Vec<String>,
    pub web_url: String,
    #[serde(default)]
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovedBy {
    pub user: UserRef,
}

#[derive(Debug, Deserialize)]
pub struct Approvals {
    pub approvals_left: u32,
    #[serde(default)]
    pub approved_by: Vec<ApprovedBy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Created,
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
    Manual,
    Scheduled,
}

#[derive(Debug, Deserialize)]
pub struct PipelineUser {
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct Pipeline {
    pub id: u64,
    pub sha: String,
    pub status: PipelineStatus,
    #[serde(default)]
    pub user: Option<PipelineUser>,
}
