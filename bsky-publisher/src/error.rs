use crate::post::PostStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Deployment errors, never retried
    #[error("key storage error: {0}")]
    KeyStorage(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("configuration error: {0}")]
    Config(String),

    // Connection failures and timeouts
    #[error("network error: {0}")]
    Network(String),

    // Credential is gone; the user must sign in again
    #[error("reauthentication required: {0}")]
    ReauthenticationRequired(String),

    // Rejected before any network call
    #[error("malformed AT URI: {0}")]
    MalformedUri(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("cannot {action} a {from} post")]
    InvalidTransition {
        from: PostStatus,
        action: &'static str,
    },

    // Non-2xx answer from the PDS or authorization server
    #[error("remote error ({status}): {message}")]
    Remote {
        status: u16,
        error: Option<String>,
        message: String,
    },

    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    StorageError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Builds a remote error from a response body, preferring the XRPC
    /// `message` field, then the OAuth `error_description`, then raw text.
    pub fn remote(status: u16, body: &[u8]) -> Self {
        let parsed: Option<serde_json::Value> = serde_json::from_slice(body).ok();
        let field = |name: &str| {
            parsed
                .as_ref()
                .and_then(|v| v.get(name))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        let error = field("error");
        let message = field("message")
            .or_else(|| field("error_description"))
            .or_else(|| error.clone())
            .unwrap_or_else(|| {
                let text = String::from_utf8_lossy(body).trim().to_string();
                if text.is_empty() {
                    format!("HTTP {}", status)
                } else {
                    text
                }
            });

        Error::Remote {
            status,
            error,
            message,
        }
    }

    /// Whether retrying the whole operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Remote { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn requires_reauth(&self) -> bool {
        matches!(self, Error::ReauthenticationRequired(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::Internal(format!("invalid response body: {}", e))
        } else {
            Error::Network(e.to_string())
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<lexicons::ValidationError> for Error {
    fn from(e: lexicons::ValidationError) -> Self {
        Error::Validation(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Config(format!("invalid url: {}", e))
    }
}

// axum IntoResponse implementation
#[cfg(feature = "axum")]
impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::Json;
        use axum::http::StatusCode;

        let status = match self {
            Error::ReauthenticationRequired(_) => StatusCode::UNAUTHORIZED,
            Error::MalformedUri(_) | Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Remote { .. } => StatusCode::BAD_GATEWAY,
            Error::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "requires_reauth": self.requires_reauth(),
        });

        (status, Json(body)).into_response()
    }
}
