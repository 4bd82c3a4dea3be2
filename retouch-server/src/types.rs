use serde::{Deserialize, Serialize};

/// Model identifier exposed on the wire.
pub const SERVED_MODEL_ID: &str = "qwen-image-edit";
pub const SERVED_MODEL_OWNER: &str = "qwen";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageData {
    /// Base64-encoded PNG
    pub b64_json: String,
}

/// Image edit response following the `OpenAI` API format
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageResponse {
    /// Unix timestamp of when the response was created
    pub created: i64,
    pub data: Vec<ImageData>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    pub device: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub version: String,
    pub endpoints: Vec<String>,
}
