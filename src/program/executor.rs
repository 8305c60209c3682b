use super::ast::{PermissionRule, Program};
use anyhow::Result;
use async_trait::async_trait;

/// One result tuple produced by a running program. Long-running programs
/// deliver later tuples out of band, through `dispatch_notify`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutput {
    Result { output_type: String, output_value: serde_json::Value },
    Error { message: String },
}

/// The program runtime, an external collaborator. The handler enqueues a
/// finished program and formats whatever comes back immediately; each error
/// tuple becomes a per-result apology without cancelling the session.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a program and return the results available synchronously.
    async fn execute(&self, unique_id: &str, program: &Program) -> Result<Vec<ExecOutput>>;

    /// Ship a remote program to the target principal.
    async fn install_remote(
        &self,
        principal: &str,
        identity: &str,
        program: &Program,
    ) -> Result<()>;

    /// Install a granted permission rule.
    async fn add_permission(&self, rule: &PermissionRule) -> Result<()>;
}
