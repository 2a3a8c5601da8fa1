use thiserror::Error;

/// Failures a pipeline stage can report to its caller.
///
/// Every variant maps onto one HTTP status in the server adapter; the message is
/// what ends up in the `{error}` body.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0} API key not configured")]
    MissingCredential(&'static str),

    #[error("{provider} API call failed: HTTP {status}")]
    Upstream { provider: &'static str, status: u16 },

    #[error("{provider} service temporarily unavailable: {source}")]
    Unavailable {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{0}")]
    MalformedResponse(String),

    /// Error body returned by a remote outfit-palette server.
    #[error("server error (HTTP {status}): {message}")]
    Remote { status: u16, message: String },

    #[error("file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Validation(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::Remote { status, .. } => *status,
            ServiceError::MissingCredential(_)
            | ServiceError::Upstream { .. }
            | ServiceError::Unavailable { .. }
            | ServiceError::MalformedResponse(_)
            | ServiceError::Io(_) => 500,
        }
    }
}
