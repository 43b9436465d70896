use std::time::Duration;

use salvo::http::StatusCode;
use salvo::prelude::*;

use crate::types::ApiError;

/// Render a standardized error response with proper HTTP status code
pub fn render_error(res: &mut Response, status: StatusCode, message: &str, error_type: &str) {
    res.status_code(status);
    res.render(Json(ApiError::new(message, error_type)));
}

/// Failure of a single request
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Malformed body, missing field or oversized payload
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Invalid image payload: {0}")]
    ImageDecode(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Generation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Service is shutting down")]
    Unavailable,
}

impl ServerError {
    pub fn inference(err: impl std::fmt::Display) -> Self {
        Self::Inference(err.to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ImageDecode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid_request_error",
            Self::ImageDecode(_) => "image_decode_error",
            Self::Inference(_) => "inference_error",
            Self::Timeout(_) => "timeout_error",
            Self::Unavailable => "service_unavailable",
        }
    }

    pub fn to_api_error(&self) -> ApiError {
        ApiError::new(&self.to_string(), self.error_type())
    }

    pub fn render(&self, res: &mut Response) {
        render_error(res, self.status_code(), &self.to_string(), self.error_type());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx() {
        assert!(ServerError::BadRequest("x".into()).status_code().is_client_error());
        assert!(ServerError::ImageDecode("x".into()).status_code().is_client_error());
        assert!(ServerError::inference("boom").status_code().is_server_error());
        assert_eq!(
            ServerError::Timeout(Duration::from_secs(3)).to_string(),
            "Generation timed out after 3s"
        );
    }
}
