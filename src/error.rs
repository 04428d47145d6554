//! Error types for streamed exchanges.

use http::Method;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

/// Everything that can terminate an exchange abnormally, from submission
/// validation through sink failure. Transport and sink errors are passed
/// through unchanged.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The factory produced a sink that does not satisfy the writable
    /// contract. No listeners were attached to it.
    #[error("invalid factory return value: {0}")]
    InvalidReturnValue(String),

    #[error("{0} is not supported")]
    NotSupported(Method),

    #[error("the dispatcher has been destroyed")]
    DispatcherDestroyed,

    #[error("the dispatcher is closed")]
    DispatcherClosed,

    /// Transport, factory, or sink failure.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(&'static str),
}
