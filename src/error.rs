use serde_json::json;
use std::fmt::Display;

use anyhow::Error as anyhowError;
use axum::{http::StatusCode, response::IntoResponse};

#[derive(Debug)]
pub enum AppError {
    // 400 bad request
    BadRequest(anyhowError),
    // 401 unauthorized
    Unauthorized(anyhowError),
    // 404 not found
    NotFound(anyhowError),
    // 500 internal server error
    InternalServerError(anyhowError),
    // 503 service unavailable
    ServiceUnavailable(anyhowError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Short machine-readable label, used in realtime exception frames.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::InternalServerError(_) => "error",
            Self::ServiceUnavailable(_) => "unavailable",
        }
    }

    /// Message that is safe to hand to a client. Internal failures and
    /// authorization failures never expose their cause.
    pub fn public_message(&self) -> String {
        match self {
            Self::BadRequest(err) | Self::NotFound(err) => err.to_string(),
            Self::Unauthorized(_) => "Unauthorized".to_string(),
            Self::InternalServerError(_) => "Internal server error".to_string(),
            Self::ServiceUnavailable(_) => "Service unavailable".to_string(),
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::BadRequest(e) => write!(f, "BadRequest: {}", e),
            AppError::Unauthorized(e) => write!(f, "Unauthorized: {}", e),
            AppError::NotFound(e) => write!(f, "NotFound: {}", e),
            AppError::InternalServerError(e) => write!(f, "InternalServerError: {}", e),
            AppError::ServiceUnavailable(e) => write!(f, "ServiceUnavailable: {}", e),
        }
    }
}

impl std::error::Error for AppError {}

impl From<anyhowError> for AppError {
    fn from(e: anyhowError) -> Self {
        AppError::InternalServerError(e)
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        let mut error_messages = String::new();
        for (field, errors) in e.field_errors() {
            for error in errors {
                error_messages.push_str(&format!(
                    "{}: {} ",
                    field,
                    error
                        .message
                        .as_ref()
                        .map_or("invalid value", |m| m.as_ref())
                ));
            }
        }
        AppError::BadRequest(anyhow::anyhow!(error_messages.trim().to_string()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        #[cfg(debug_assertions)]
        let error_response = json!({
            "error": {
                "message": self.public_message(),
                "type": format!("{:?}", self),
            }
        });

        #[cfg(not(debug_assertions))]
        let error_response = json!({
            "error": {
                "message": match status {
                    StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => self.public_message(),
                    _ => status.canonical_reason().unwrap_or("An error occurred").to_string(),
                },
            }
        });
        (status, axum::Json(error_response)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn unauthorized_message_does_not_leak_cause() {
        let err = AppError::Unauthorized(anyhow!("password mismatch for chat 42"));
        assert_eq!(err.public_message(), "Unauthorized");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn internal_message_is_generic() {
        let err = AppError::InternalServerError(anyhow!("connection refused (os error 111)"));
        assert_eq!(err.public_message(), "Internal server error");
    }

    #[test]
    fn bad_request_keeps_reason() {
        let err = AppError::BadRequest(anyhow!("limit must be between 1 and 250"));
        assert_eq!(err.public_message(), "limit must be between 1 and 250");
    }
}
