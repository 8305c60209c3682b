use thiserror::Error;

/// The error taxonomy of the dialogue loop.
///
/// `Cancelled` is the single signal for voluntary aborts: `special:nevermind`,
/// the STOP analysis, `reset()` and `stop()` all surface as this variant. It
/// unwinds every sub-dialogue to the loop, which resets the session and keeps
/// running. Everything else is converted to a localized apology at the loop
/// boundary; handlers never observe another handler's errors.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Voluntary abort of the current sub-dialogue (`ECANCELLED`).
    #[error("cancelled")]
    Cancelled,

    /// NLU/NLG or another backing service is unreachable or failing.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The utterance or token stream did not parse or type-check.
    #[error("parse error: {0}")]
    Parse(String),

    /// A single executor result failed; the session survives.
    #[error("executor error: {0}")]
    Executor(String),

    /// The queue was torn down while a waiter was parked. Only seen during
    /// shutdown.
    #[error("queue closed")]
    QueueClosed,

    #[error("{0}")]
    Unexpected(String),
}

impl AgentError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl From<anyhow::Error> for AgentError {
    fn from(e: anyhow::Error) -> Self {
        AgentError::Unexpected(e.to_string())
    }
}
