use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Which resource budget a rejected admission or subscription ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    ConnectionsPerUser { max: usize },
    TopicsPerSession { max: usize },
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Limit::ConnectionsPerUser { max } => {
                write!(f, "connection limit of {max} per user reached")
            }
            Limit::TopicsPerSession { max } => {
                write!(f, "topic limit of {max} per session reached")
            }
        }
    }
}

/// Errors returned by hub operations. Per-session failures never surface
/// here; they end in eviction instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("limit exceeded: {0}")]
    LimitExceeded(Limit),
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("session is not admitted")]
    UnknownSession,
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    #[error("hub is not running")]
    Unavailable,
    #[error("hub is overloaded, retry later")]
    Overloaded,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Unauthorized(String),
    Forbidden(String),
    LimitExceeded(String),
    Unavailable(String),
    RateLimited { retry_after: u64 },
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "invalid_request",
            AppError::NotFound(_) => "not_found",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::LimitExceeded(_) => "limit_exceeded",
            AppError::Unavailable(_) => "unavailable",
            AppError::RateLimited { .. } => "rate_limited",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::LimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::LimitExceeded(msg)
            | AppError::Unavailable(msg) => msg.clone(),
            AppError::RateLimited { retry_after } => {
                format!("rate limited, retry after {retry_after}s")
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.message()
            }
        });

        let mut response = (status, Json(body)).into_response();
        if let AppError::RateLimited { retry_after } = &self {
            response
                .headers_mut()
                .insert("Retry-After", axum::http::HeaderValue::from(*retry_after));
        }
        response
    }
}

impl From<HubError> for AppError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::LimitExceeded(limit) => AppError::LimitExceeded(limit.to_string()),
            HubError::ShuttingDown | HubError::Unavailable | HubError::Overloaded => {
                AppError::Unavailable(e.to_string())
            }
            HubError::UnknownSession => AppError::NotFound(e.to_string()),
            HubError::InvalidTopic(_) => AppError::BadRequest(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_messages() {
        let err = HubError::LimitExceeded(Limit::ConnectionsPerUser { max: 5 });
        assert_eq!(
            err.to_string(),
            "limit exceeded: connection limit of 5 per user reached"
        );
        let err = HubError::LimitExceeded(Limit::TopicsPerSession { max: 50 });
        assert!(err.to_string().contains("50 per session"));
    }

    #[test]
    fn test_hub_error_status_mapping() {
        let limit = AppError::from(HubError::LimitExceeded(Limit::TopicsPerSession { max: 1 }));
        assert_eq!(limit.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            AppError::from(HubError::ShuttingDown).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::from(HubError::InvalidTopic("empty".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(HubError::Overloaded).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = AppError::RateLimited { retry_after: 7 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["Retry-After"], "7");
    }
}
