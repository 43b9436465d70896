use serde::{Deserialize, Serialize};

/// OpenAI-style error envelope, also used as the terminal line of a
/// failed ndjson stream
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub message: String,
    pub r#type: String,
}

impl ApiError {
    pub fn new(message: &str, error_type: &str) -> Self {
        Self {
            error: ApiErrorDetail {
                message: message.to_string(),
                r#type: error_type.to_string(),
            },
        }
    }
}
