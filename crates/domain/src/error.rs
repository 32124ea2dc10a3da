/// Shared error type used across all colloquy crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation: {0}")]
    Validation(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("database: {0}")]
    Database(String),

    #[error("config: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wire code surfaced in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "BAD_EVENT",
            Error::Auth(_) => "AUTH",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Provider { .. } => "PROVIDER_ERROR",
            Error::Cancelled => "CANCELLED",
            _ => "INTERNAL_ERROR",
        }
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        assert_eq!(Error::Validation("x".into()).code(), "BAD_EVENT");
        assert_eq!(Error::Cancelled.code(), "CANCELLED");
        assert_eq!(Error::NotFound("agent".into()).code(), "NOT_FOUND");
        assert_eq!(Error::Internal("boom".into()).code(), "INTERNAL_ERROR");
        assert_eq!(Error::provider("ollama", "down").code(), "PROVIDER_ERROR");
    }
}
