use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::time::Duration;
use thiserror::Error as ThisError;

/// Every way an upload can fail. Each variant terminates the pipeline at the stage that produced it.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Malformed or missing multipart part, rejected content id, or storage write failure
    #[error("{message}")]
    Upload { message: String },

    /// The OS randomness source could not produce a content identifier
    #[error("Failed to generate content identifier: {message}")]
    IdentifierGeneration { message: String },

    /// PDF to web publication conversion failed
    #[error("Failed to package publication: {message}")]
    Packaging { message: String },

    /// The encryption engine or encryption process failed
    #[error("Failed to encrypt publication: {message}")]
    Encryption { message: String },

    /// The external encryption process did not finish in time and was killed
    #[error("Encryption process did not finish within {}", humantime::format_duration(*timeout))]
    EncryptionTimeout { timeout: Duration },

    /// The external encryption process was killed because the server is shutting down
    #[error("Encryption process was cancelled")]
    EncryptionCancelled,

    /// The licensing server answered with a status other than 2xx or 302
    #[error("LCP server rejected content with status {status}")]
    Notification { status: u16 },

    /// The licensing server could not be reached
    #[error("Failed to reach LCP server: {message}")]
    NotificationTransport { message: String },
}

impl Error {
    pub fn upload(message: impl Into<String>) -> Self {
        Error::Upload { message: message.into() }
    }

    /// Every failure maps to 500: no stage distinguishes caller mistakes from environment faults,
    /// and existing callers depend on that contract.
    pub fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    /// Short stable name used as a metrics label and in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Upload { .. } => "upload",
            Error::IdentifierGeneration { .. } => "identifier_generation",
            Error::Packaging { .. } => "packaging",
            Error::Encryption { .. } => "encryption",
            Error::EncryptionTimeout { .. } => "encryption_timeout",
            Error::EncryptionCancelled => "encryption_cancelled",
            Error::Notification { .. } => "notification",
            Error::NotificationTransport { .. } => "notification_transport",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Upload { .. } => tracing::warn!(kind = self.kind(), "Upload rejected: {}", self),
            _ => tracing::error!(kind = self.kind(), "Upload failed: {}", self),
        }

        (self.status_code(), self.to_string()).into_response()
    }
}

/// Type alias for pipeline results
pub type Result<T> = std::result::Result<T, Error>;
