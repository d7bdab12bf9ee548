use serde::Serialize;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("{0}")]
    RateLimited(String),
    #[error("{0}")]
    QuotaExceeded(String),
    #[error("Function error: {status} - {message}")]
    Function { status: u16, message: String },
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Realtime error: {0}")]
    Realtime(String),
    #[error("Connection lock poisoned")]
    Poisoned,
}

impl Error {
    /// Text suitable for a transient toast. Rate-limit and quota errors keep
    /// the server's wording, everything else collapses to a generic line.
    pub fn user_message(&self) -> String {
        match self {
            Error::RateLimited(message) | Error::QuotaExceeded(message) => message.clone(),
            Error::NotAuthenticated => "Please sign in to continue.".to_string(),
            Error::Function { message, .. } if !message.is_empty() => message.clone(),
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited(_))
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Error::QuotaExceeded(_))
    }
}

impl Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_keeps_rate_limit_text() {
        let err = Error::RateLimited("Rate limit exceeded. Please try again in a moment.".into());
        assert!(err.is_rate_limited());
        assert_eq!(
            err.user_message(),
            "Rate limit exceeded. Please try again in a moment."
        );
    }

    #[test]
    fn test_user_message_generic_for_remote_errors() {
        let err = Error::Api {
            status: 500,
            message: "boom".into(),
        };
        assert_eq!(err.user_message(), "Something went wrong. Please try again.");
    }

    #[test]
    fn test_serializes_as_display_string() {
        let json = serde_json::to_string(&Error::NotAuthenticated).unwrap();
        assert_eq!(json, "\"Not authenticated\"");
    }
}
