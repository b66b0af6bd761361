use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Broker error: {0}")]
    BrokerError(#[from] BrokerError),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    GateRejected { retry_after_secs: u64 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => AppError::AuthError(AuthError::TokenExpired),
            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => AppError::AuthError(AuthError::InvalidToken),
            _ => AppError::InternalError(err.to_string()),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = self.to_string();
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "message": message
            }
        });
        let mut builder = HttpResponse::build(status);
        if let AppError::GateRejected { retry_after_secs } = self {
            builder.insert_header(("Retry-After", retry_after_secs.to_string()));
        }
        builder.json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::AuthError(e) => match e {
                AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
                AuthError::TokenExpired => StatusCode::UNAUTHORIZED,
                AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
                AuthError::Unauthorized => StatusCode::FORBIDDEN,
                AuthError::UserExists => StatusCode::CONFLICT,
            },
            AppError::GateRejected { .. } => StatusCode::TOO_MANY_REQUESTS,
            // Only reachable when auditing runs fail-closed.
            AppError::BrokerError(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("User already exists")]
    UserExists,
}

/// Failures of the audit publishing path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker unreachable, connect timed out, or broker authentication refused.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// An exchange or queue already exists with incompatible properties.
    #[error("Topology conflict on {resource}: {reason}")]
    TopologyConflict { resource: String, reason: String },

    /// Channel or connection no longer usable while publishing.
    #[error("Publish error: {0}")]
    PublishError(String),
}

impl BrokerError {
    /// Whether another attempt on a fresh connection could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, BrokerError::TopologyConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let app_err: AppError = io_err.into();
        assert!(matches!(app_err, AppError::InternalError(_)));

        let config_err = config::ConfigError::NotFound(String::from("key not found"));
        let app_err: AppError = config_err.into();
        assert!(matches!(app_err, AppError::ConfigError(_)));

        let broker_err = BrokerError::ConnectionError("refused".into());
        let app_err: AppError = broker_err.into();
        assert!(matches!(app_err, AppError::BrokerError(BrokerError::ConnectionError(_))));
    }

    #[test]
    fn test_error_status_codes() {
        let err = AppError::AuthError(AuthError::InvalidCredentials);
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);

        let err = AppError::AuthError(AuthError::Unauthorized);
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);

        let err = AppError::AuthError(AuthError::UserExists);
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err = AppError::ValidationError("invalid input".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = AppError::GateRejected { retry_after_secs: 3 };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);

        let err = AppError::BrokerError(BrokerError::PublishError("channel closed".into()));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_gate_rejection_sets_retry_after() {
        let resp = AppError::GateRejected { retry_after_secs: 7 }.error_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("Retry-After").unwrap(), "7");
    }

    #[test]
    fn test_error_display() {
        let err = AppError::ValidationError("test error".to_string());
        assert_eq!(err.to_string(), "Validation error: test error");

        let err = AppError::AuthError(AuthError::InvalidCredentials);
        assert_eq!(err.to_string(), "Authentication error: Invalid credentials");

        let err = AppError::BrokerError(BrokerError::TopologyConflict {
            resource: "exchange rate_limit_exchange".into(),
            reason: "type mismatch".into(),
        });
        assert_eq!(
            err.to_string(),
            "Broker error: Topology conflict on exchange rate_limit_exchange: type mismatch"
        );
    }

    #[test]
    fn test_topology_conflict_is_not_transient() {
        assert!(BrokerError::ConnectionError("down".into()).is_transient());
        assert!(BrokerError::PublishError("closed".into()).is_transient());
        assert!(!BrokerError::TopologyConflict {
            resource: "queue q".into(),
            reason: "durable mismatch".into(),
        }
        .is_transient());
    }
}
