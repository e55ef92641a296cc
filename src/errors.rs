// src/errors.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Redis error: {0}")]
    RedisError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("M-Pesa error: {0}")]
    MpesaError(String),

    #[error("External API error: {0}")]
    ExternalApi(String),

    #[error("Authentication error")]
    AuthError,

    #[error("Unauthorized access")]
    Unauthorized,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Service error: {0}")]
    ServiceError(String),
}

impl AppError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::AuthError => (StatusCode::UNAUTHORIZED, "Authentication failed".to_string()),
            AppError::Unauthorized => (StatusCode::FORBIDDEN, "Unauthorized access".to_string()),
            AppError::MpesaError(_) => (StatusCode::BAD_GATEWAY, "M-Pesa error".to_string()),
            AppError::ExternalApi(_) => (StatusCode::BAD_GATEWAY, "External API error".to_string()),
            AppError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable".to_string())
            }
            // Storage details never leave the process
            AppError::Database(_)
            | AppError::RedisError(_)
            | AppError::Conflict(_)
            | AppError::ConfigurationError(_)
            | AppError::ServiceError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Request failed".to_string())
            }
        }
    }

    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            AppError::ValidationError(_)
                | AppError::NotFound(_)
                | AppError::AuthError
                | AppError::Unauthorized
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = self.status_and_message();

        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let body = Json(json!({
            "error": error_message,
            "message": if status.is_server_error() { error_message.clone() } else { self.to_string() },
            "success": false,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::NotFound("stk transaction".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(db_err.message().to_string())
            }
            _ => AppError::Database(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::Database(format!("migration failed: {}", err))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::RedisError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ValidationError(format!("JSON parsing error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalApi(format!("HTTP request failed: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(_: jsonwebtoken::errors::Error) -> Self {
        AppError::AuthError
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errs: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = errs
            .field_errors()
            .into_iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("invalid {}", field))
                })
            })
            .collect();
        messages.sort();
        AppError::ValidationError(messages.join(", "))
    }
}

// Helper conversion functions
impl AppError {
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        AppError::ValidationError(msg.into())
    }

    pub fn missing_field(field: &str) -> Self {
        AppError::ValidationError(format!("missing {}", field))
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn mpesa(msg: impl Into<String>) -> Self {
        AppError::MpesaError(msg.into())
    }

    pub fn external_api(msg: impl Into<String>) -> Self {
        AppError::ExternalApi(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        AppError::ConfigurationError(msg.into())
    }

    pub fn service(msg: impl Into<String>) -> Self {
        AppError::ServiceError(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
