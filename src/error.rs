use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use thiserror::Error;

/// Every failure a pipeline step or the generation façade can surface.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AppError {
    #[error("{0}")] Validation(String),
    #[error("Generation blocked: {0}")] GenerationBlocked(String),
    #[error("Empty response: {0}")] EmptyResponse(String),
    #[error("No image produced: {0}")] NoImageProduced(String),
    #[error("Could not read payload: {0}")] PayloadRead(String),
    #[error("Summary failed: {0}")] Summary(String),
    #[error("Archive error: {0}")] Archive(String),
    #[error("Service error: {0}")] Service(String),
    #[error("Capture error: {0}")] Capture(String),
    #[error("A step is already in progress")] SessionBusy,
    #[error("API key required")] CredentialMissing,
    #[error("Not found: {0}")] NotFound(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::PayloadRead(_) => StatusCode::BAD_REQUEST,
            AppError::GenerationBlocked(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::EmptyResponse(_)
            | AppError::NoImageProduced(_)
            | AppError::Summary(_)
            | AppError::Service(_) => StatusCode::BAD_GATEWAY,
            AppError::Archive(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Capture(_) | AppError::SessionBusy => StatusCode::CONFLICT,
            AppError::CredentialMissing => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("❌ {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Size check shared by every upload path. Fails before any network call.
pub fn check_size(len: usize, min: Option<usize>, max: usize) -> Result<(), AppError> {
    if len > max {
        return Err(AppError::Validation(format!(
            "file is {} bytes, exceeding the maximum of {} bytes",
            len, max
        )));
    }
    if let Some(min) = min {
        if len < min {
            return Err(AppError::Validation(format!(
                "file is {} bytes, below the minimum of {} bytes; audio is too short",
                len, min
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_check_reports_size_and_bound() {
        let err = check_size(30, None, 20).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let msg = err.to_string();
        assert!(msg.contains("30") && msg.contains("20"));

        let err = check_size(5, Some(10), 20).unwrap_err();
        assert!(err.to_string().contains("10"));
        assert!(check_size(10, Some(10), 20).is_ok());
        assert!(check_size(20, None, 20).is_ok());
    }

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(AppError::CredentialMissing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::SessionBusy.status(), StatusCode::CONFLICT);
        assert_eq!(AppError::GenerationBlocked("SAFETY".into()).status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
