use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::errors::BackupError;

/// Failure returned by an HTTP handler, rendered as
/// `{success:false, error, details?}`.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Backup(#[from] BackupError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Backup(e) => match e {
                BackupError::Config(_) => StatusCode::BAD_REQUEST,
                BackupError::RunInProgress => StatusCode::CONFLICT,
                BackupError::Integrity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                BackupError::Dump { .. } | BackupError::Upload(_) | BackupError::Storage(_) => {
                    StatusCode::BAD_GATEWAY
                }
                BackupError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                BackupError::Aborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "success": false,
            "error": self.to_string(),
        });
        if let ApiError::Backup(e) = &self {
            body["kind"] = json!(e.kind());
            if let Some(details) = e.details() {
                body["details"] = details;
            }
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StorageError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (BackupError::Config("missing S3 bucket name".into()), StatusCode::BAD_REQUEST),
            (BackupError::RunInProgress, StatusCode::CONFLICT),
            (BackupError::Integrity { errors: vec![] }, StatusCode::UNPROCESSABLE_ENTITY),
            (
                BackupError::Upload(StorageError::new("put_object", "k", "denied")),
                StatusCode::BAD_GATEWAY,
            ),
            (
                BackupError::Timeout(std::time::Duration::from_secs(300)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                BackupError::Aborted("backup task panicked".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
        assert_eq!(ApiError::NotFound("run".into()).status(), StatusCode::NOT_FOUND);
    }
}
