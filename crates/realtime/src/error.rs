use shared::{
    domain::ConversationId,
    error::{ApiError, ErrorCode},
};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("missing or malformed credential")]
    Unauthenticated,
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("account is unavailable")]
    AccountUnavailable,
    #[error("not allowed in conversation {0}")]
    Forbidden(ConversationId),
    #[error("not a member of conversation {0}")]
    NotMember(ConversationId),
    #[error("unknown presence status '{0}'")]
    InvalidStatus(String),
    #[error("invalid read cursor: {0}")]
    InvalidCursor(String),
    #[error("{0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Persistence(String),
}

impl RealtimeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthenticated => ErrorCode::Unauthenticated,
            Self::InvalidCredential(_) => ErrorCode::InvalidCredential,
            Self::AccountUnavailable => ErrorCode::AccountUnavailable,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::NotMember(_) => ErrorCode::NotMember,
            Self::InvalidStatus(_) => ErrorCode::InvalidStatus,
            Self::InvalidCursor(_) => ErrorCode::InvalidCursor,
            Self::Validation(_) => ErrorCode::Validation,
            Self::Persistence(_) => ErrorCode::PersistenceError,
        }
    }

    pub fn to_api_error(&self) -> ApiError {
        ApiError::new(self.code(), self.to_string())
    }
}

impl From<RealtimeError> for ApiError {
    fn from(value: RealtimeError) -> Self {
        value.to_api_error()
    }
}

pub(crate) fn persistence(err: anyhow::Error) -> RealtimeError {
    error!(error = %format!("{err:#}"), "storage call failed");
    RealtimeError::Persistence(err.to_string())
}
