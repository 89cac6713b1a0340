use serde::Serialize;
use thiserror::Error;

/// A single rejected input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self { field, message: message.into() }
    }
}

/// Error taxonomy of the group-chat core.
///
/// `Forbidden`, `NotFound` and `Conflict` carry a translatable message key that is sent to
/// the client verbatim; `Internal` carries operator detail that never leaves the server.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("validation failed: {0:?}")]
    Validation(Vec<FieldError>),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ChatResult<T> = Result<T, ChatError>;

pub const NOT_FOUND: &str = "error.not_found";
pub const GROUP_NOT_FOUND: &str = "error.group_not_found";
pub const NOT_CREATOR: &str = "error.not_creator_of_group";
pub const NOT_MEMBER: &str = "error.not_member_of_group";
pub const CREATOR_CANNOT_LEAVE: &str = "error.creator_cannot_leave";
pub const DUPLICATE_FIELD: &str = "error.duplicate_field_value_entered";

// Per-field keys carried in `FieldError::message`
pub const FIELD_REQUIRED: &str = "error.field_required";
pub const FIELD_TOO_LONG: &str = "error.field_too_long";
pub const FIELD_NOT_ALLOWED: &str = "error.field_not_allowed";
pub const INVALID_EMAIL: &str = "error.invalid_email";
pub const INVALID_MESSAGE_TYPE: &str = "error.invalid_message_type";
pub const INVALID_PAGE: &str = "error.invalid_page";
pub const INVALID_LIMIT: &str = "error.invalid_limit";
pub const MALFORMED_REQUEST: &str = "error.malformed_request";

impl ChatError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        ChatError::Validation(vec![FieldError::new(field, message)])
    }

    /// Stable message key for clients.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "error.validation",
            ChatError::Unauthorized => "error.not_authorize",
            ChatError::Forbidden(key) | ChatError::NotFound(key) | ChatError::Conflict(key) => *key,
            ChatError::Internal(_) => "error.server_error",
        }
    }

    /// HTTP-equivalent status class.
    pub fn status(&self) -> u16 {
        match self {
            ChatError::Validation(_) => 400,
            ChatError::Unauthorized => 401,
            ChatError::Forbidden(_) => 403,
            ChatError::NotFound(_) => 404,
            ChatError::Conflict(_) => 409,
            ChatError::Internal(_) => 500,
        }
    }

    pub fn fields(&self) -> Option<&[FieldError]> {
        match self {
            ChatError::Validation(fields) => Some(fields),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(e: sqlx::Error) -> Self {
        if let Some(db_err) = e.as_database_error() {
            if db_err.is_unique_violation() {
                return ChatError::Conflict(DUPLICATE_FIELD);
            }
        }
        ChatError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Internal(format!("json: {}", e))
    }
}
