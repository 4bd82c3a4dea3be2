use axum::{
    extract::multipart::{MultipartError, MultipartRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use retouch_core::EditError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ApiError>;

/// Failures surfaced at the HTTP boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Caller mistake; the message is returned as is.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    MethodNotAllowed(String),

    /// Anything else. Details are logged, never returned.
    #[error("An unexpected error occurred")]
    Internal(#[source] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::NotFound(_) | Self::MethodNotAllowed(_) => {
                "invalid_request_error"
            }
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<EditError> for ApiError {
    fn from(err: EditError) -> Self {
        match err {
            EditError::EmptyPrompt => Self::InvalidRequest(err.to_string()),
            EditError::NotReady => Self::Internal(anyhow::Error::new(err)),
            EditError::Inference(source) => Self::Internal(source.context("inference failed")),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::InvalidRequest(err.body_text())
    }
}

/// Error envelope compatible with the `OpenAI` API
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    message: String,
    r#type: String,
    code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(source) = &self {
            error!("Unexpected error: {source:#}");
        }
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetails {
                message: self.to_string(),
                r#type: self.error_type().to_string(),
                code: status.as_u16(),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn client_errors_keep_their_message() {
        let (status, json) = body(ApiError::InvalidRequest(
            "Model 'dall-e-3' not found. Available models: qwen-image-edit".to_string(),
        ))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            json,
            serde_json::json!({
                "error": {
                    "message": "Model 'dall-e-3' not found. Available models: qwen-image-edit",
                    "type": "invalid_request_error",
                    "code": 400
                }
            })
        );
    }

    #[tokio::test]
    async fn internal_errors_hide_details() {
        let source = anyhow::anyhow!("CUDA_ERROR_OUT_OF_MEMORY at 0xdeadbeef");
        let (status, json) = body(ApiError::Internal(source)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"]["message"], "An unexpected error occurred");
        assert_eq!(json["error"]["type"], "internal_error");
        assert_eq!(json["error"]["code"], 500);
        assert!(!json.to_string().contains("CUDA"));
    }

    #[test]
    fn edit_errors_are_classified() {
        assert!(matches!(
            ApiError::from(EditError::EmptyPrompt),
            ApiError::InvalidRequest(_)
        ));
        assert!(matches!(
            ApiError::from(EditError::NotReady),
            ApiError::Internal(_)
        ));
        assert!(matches!(
            ApiError::from(EditError::Inference(anyhow::anyhow!("boom"))),
            ApiError::Internal(_)
        ));
    }
}
