use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

/// Error taxonomy for the account API. Mapping to HTTP status and body
/// happens only in [`IntoResponse`]; handlers and the repo return these
/// variants and never build responses themselves.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Username already registered")]
    DuplicateUsername,
    #[error("Email already registered")]
    DuplicateEmail,
    #[error("Incorrect username or password")]
    InvalidCredentials,
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Could not validate credentials")]
    InvalidToken,
    #[error("Database is unavailable")]
    StorageUnavailable,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DuplicateUsername | Self::DuplicateEmail => StatusCode::BAD_REQUEST,
            Self::InvalidCredentials | Self::NotAuthenticated | Self::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            Self::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => ApiError::StorageUnavailable,
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal details stay in the logs; the client gets a generic line.
        let detail = match &self {
            Self::Internal(e) => {
                error!(error = %e, "internal error");
                "Internal server error".to_string()
            }
            Self::StorageUnavailable => {
                error!("database unavailable");
                self.to_string()
            }
            other => other.to_string(),
        };

        let body = axum::Json(json!({ "detail": detail }));
        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
