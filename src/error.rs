use thiserror::Error;

use crate::presence::ConnectionId;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("missing or invalid credential")]
    Unauthenticated,

    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("sender {0} does not exist")]
    SenderNotFound(i64),

    #[error("storage failure: {0}")]
    StorageFailure(#[from] sqlx::Error),

    #[error("push to connection {0} failed")]
    DeliveryFailure(ConnectionId),

    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Forbidden(&'static str),
}

pub type ChatResult<T> = Result<T, ChatError>;
