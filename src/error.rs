//! Error types for the broker and its backend adapters

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers of the broker.
///
/// Backend failures are deliberately absent here: the dispatcher catches
/// [`BackendError`] and answers with an empty, well-formed response instead
/// of failing the request.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no staged session with id '{0}'")]
    SessionNotFound(String),

    #[error("engine '{engine}' did not answer within {waited:?}")]
    RunLoopTimeout { engine: String, waited: Duration },

    #[error("could not decode image payload: {0}")]
    InvalidImage(String),
}

impl From<image::ImageError> for BrokerError {
    fn from(err: image::ImageError) -> Self {
        Self::InvalidImage(err.to_string())
    }
}

impl From<base64::DecodeError> for BrokerError {
    fn from(err: base64::DecodeError) -> Self {
        Self::InvalidImage(err.to_string())
    }
}

/// Errors raised inside a backend adapter.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("native OCR API failed: {message}")]
    Native { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn native(message: impl Into<String>) -> Self {
        Self::Native {
            message: message.into(),
        }
    }
}

impl From<ort::Error> for BackendError {
    fn from(err: ort::Error) -> Self {
        Self::Inference(err.to_string())
    }
}
