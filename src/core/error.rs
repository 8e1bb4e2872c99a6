use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("Invalid scope configuration: {0}")]
    InvalidConfiguration(String),

    #[error(
        "You cannot call commit() more than once on a scope. A scope is meant to encapsulate a \
         business transaction: create the scope at the start of the business transaction and \
         commit at the end. Committing mid-way through a business transaction most likely means \
         the work should be refactored into two operations that each open their own scope."
    )]
    AlreadyCompleted,

    #[error("Cannot access a disposed object: {0}")]
    ObjectDisposed(String),

    #[error("No open ambient scope was found")]
    NoAmbientScope,

    #[error(
        "Scopes opened inside a tokio runtime need a flow-local ambient slot. Run the code that \
         opens the scope through dbscope::flow(..) or dbscope::inherit(..), or open it from \
         synchronous code outside the runtime."
    )]
    NoFlowContext,

    #[error("The ambient scope is read-only and cannot save changes")]
    ReadOnlyAmbientScope,

    #[error("No session constructor registered for '{0}'")]
    UnregisteredSession(String),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Scopes must be disposed of in the order in which they were created")]
    OutOfOrderDisposal,

    #[error("{0}")]
    ParentScopeDisposed(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Lock error: {0}")]
    LockError(String),
}

impl ScopeError {
    /// Misuse of the scope protocol that indicates broken concurrency handling
    /// in the caller.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ScopeError::OutOfOrderDisposal | ScopeError::ParentScopeDisposed(_)
        )
    }

    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            ScopeError::AlreadyCompleted
                | ScopeError::ObjectDisposed(_)
                | ScopeError::NoAmbientScope
                | ScopeError::NoFlowContext
                | ScopeError::ReadOnlyAmbientScope
                | ScopeError::UnregisteredSession(_)
                | ScopeError::Usage(_)
        )
    }

    pub fn is_configuration_error(&self) -> bool {
        matches!(self, ScopeError::InvalidConfiguration(_))
    }
}

pub type Result<T> = std::result::Result<T, ScopeError>;

impl<T> From<std::sync::PoisonError<T>> for ScopeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for ScopeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(format!("entity serialization failed: {}", err))
    }
}
