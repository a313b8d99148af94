/// Errors surfaced by the dispatch engine.
///
/// `Clone` so a single outcome can be handed to every coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// The caller's cancellation token fired before a reply arrived.
    #[error("Canceled: {0}")]
    Canceled(String),

    /// The selected shard queue was full at enqueue time.
    #[error("Server overloaded (shard {shard}), please retry later")]
    Overloaded { shard: usize },

    /// The work executor reported a failure.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// A malformed job or broken internal channel.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}

impl CoreError {
    /// Cancellation caused by the caller's own context.
    pub fn canceled() -> Self {
        Self::Canceled("context canceled".to_string())
    }

    /// Cancellation caused by a deadline elapsing.
    pub fn deadline_exceeded() -> Self {
        Self::Canceled("context deadline exceeded".to_string())
    }
}
