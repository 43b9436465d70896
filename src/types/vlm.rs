use serde::{Deserialize, Serialize};

/// Prompt used by the caption endpoints
pub const CAPTION_PROMPT: &str = "Generate a detailed caption for this image.";

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    /// `data:<mime>;base64,<payload>` URL or bare base64
    pub image_url: String,
    pub question: String,
}

#[derive(Debug, Deserialize)]
pub struct CaptionRequest {
    pub image_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CaptionResponse {
    pub caption: String,
}

/// One line of an ndjson stream
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamChunk {
    pub chunk: String,
}
