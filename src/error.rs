use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the chat lifecycle, assignment and messaging core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Conflict(#[from] Conflict),

    /// No agent slot could be reserved right now. The scheduler retries on its next tick.
    #[error("no support agent has free capacity")]
    CapacityExhausted,

    #[error("persistence failure: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

/// State conflicts: the request is well-formed but the chat is in the wrong state
/// or the caller is the wrong participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Conflict {
    #[error("a chat already exists for this order")]
    OrderAlreadyHasChat,
    #[error("chat is not waiting for assignment")]
    NotWaiting,
    #[error("chat is not pending")]
    NotPending,
    #[error("chat is not assigned to this agent")]
    NotAssignedToAgent,
    #[error("chat is already closed")]
    AlreadyClosed,
    #[error("chat is not closed")]
    NotClosed,
    #[error("only the chat owner may do this")]
    NotOwner,
    #[error("sender is not a participant of this chat")]
    AccessDenied,
    #[error("chat does not accept messages in its current state")]
    InvalidChatState,
}

impl Error {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Error::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// The conflict carried by this error, if any.
    pub fn conflict(&self) -> Option<Conflict> {
        match self {
            Error::Conflict(c) => Some(*c),
            _ => None,
        }
    }
}
