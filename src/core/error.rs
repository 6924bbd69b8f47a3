use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Errors surfaced by the session hub.
///
/// Request paths return these synchronously. Background work (cron firings,
/// event dispatch, resurrection) records them on the run/event row instead.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("agent backend failed: {0}")]
    Upstream(String),
    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    pub fn validation(msg: impl Into<String>) -> Self {
        HubError::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        HubError::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        HubError::Conflict(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            HubError::Validation(_) => StatusCode::BAD_REQUEST,
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::Conflict(_) => StatusCode::CONFLICT,
            HubError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            HubError::Upstream(_) => StatusCode::BAD_GATEWAY,
            HubError::Persistence(_) | HubError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (
            status,
            Json(serde_json::json!({ "success": false, "error": self.to_string() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_status() {
        assert_eq!(
            HubError::validation("name is required").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            HubError::not_found("task abc").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HubError::conflict("event is not pending").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            HubError::Upstream("exit 1".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn not_found_message_names_the_target() {
        assert_eq!(HubError::not_found("session s1").to_string(), "session s1 not found");
    }
}
