use thiserror::Error;

/// Coordinator error taxonomy. Validation and authorization errors are
/// surfaced to the client verbatim and never retried; repository errors are
/// retryable and degrade fail-safe at the call site.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("invalid room id (3-50 chars, letters/digits/_/-)")]
    InvalidRoomId,
    #[error("invalid username (1-30 chars after trimming)")]
    InvalidUsername,
    #[error("invalid room config: {0}")]
    InvalidConfig(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("room id already taken: {0}")]
    RoomIdTaken(String),
    #[error("room is full")]
    RoomFull,

    #[error("invalid reconnection token")]
    InvalidToken,
    #[error("reconnection token expired")]
    TokenExpired,

    #[error("not a member of this room")]
    NotInRoom,
    #[error("target participant is not in this room")]
    TargetNotInRoom,
    #[error("connection already joined to room {0}")]
    AlreadyInRoom(String),

    #[error("message not found")]
    MessageNotFound,
    #[error("only the message author may edit it")]
    NotAuthor,
    #[error("not authorized to delete this message")]
    NotAuthorized,

    #[error("message content is empty")]
    EmptyContent,
    #[error("message content exceeds {0} characters")]
    ContentTooLong(usize),

    #[error("repository unavailable: {0}")]
    Repository(String),
}

impl CoordinatorError {
    /// Whether a client may retry the same request and expect a different
    /// outcome. Only transient repository failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinatorError::Repository(_))
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
