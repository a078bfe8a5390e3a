//! The forge abstraction: everything the merge job needs from GitLab.

mod traits;
mod types;

pub use self::traits::ForgeClient;
pub use self::traits::ForgeError;
pub use self::traits::ForgeResult;

pub use self::types::Approvals;
pub use self::types::Branch;
pub use self::types::MergeRequest;
pub use self::types::MergeRequestState;
pub use self::types::Pipeline;
pub use self::types::PipelineStatus;
pub use self::types::Project;
pub use self::types::ProjectId;
pub use self::types::User;
pub use self::types::UserId;
