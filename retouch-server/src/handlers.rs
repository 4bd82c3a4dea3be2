use std::{io::Cursor, str::FromStr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{
        multipart::{Field, MultipartRejection},
        Multipart, State,
    },
    Json,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::{DynamicImage, ImageFormat};
use retouch_core::{EditRequest, ModelResource};
use tracing::{debug, info};

use crate::{
    error::{ApiError, Result},
    types::{
        HealthResponse, ImageData, ImageResponse, ModelInfo, ModelsResponse, ServiceDescriptor,
        SERVED_MODEL_ID, SERVED_MODEL_OWNER,
    },
    AppState,
};

pub const EDITS_PATH: &str = "/v1/images/edits";
pub const MODELS_PATH: &str = "/v1/models";
pub const HEALTH_PATH: &str = "/v1/health";

/// Upper bound on per-request denoising steps.
pub const MAX_INFERENCE_STEPS: usize = 1000;

/// Fields of an edit upload. Unknown fields (`n`, `size`, `response_format`,
/// ...) are accepted and ignored.
#[derive(Debug, Default)]
pub struct EditForm {
    pub image: Option<Vec<u8>>,
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub seed: Option<u64>,
    pub guidance_scale: Option<f64>,
    pub num_inference_steps: Option<usize>,
    pub negative_prompt: Option<String>,
}

impl EditForm {
    pub async fn from_multipart(mut multipart: Multipart) -> Result<Self> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            match name.as_str() {
                "image" => form.image = Some(field.bytes().await?.to_vec()),
                "prompt" => form.prompt = Some(field.text().await?),
                "model" => form.model = Some(field.text().await?),
                "negative_prompt" => form.negative_prompt = Some(field.text().await?),
                "seed" => form.seed = Some(parse_field(&name, field).await?),
                "guidance_scale" => form.guidance_scale = Some(parse_field(&name, field).await?),
                "num_inference_steps" => {
                    form.num_inference_steps = Some(parse_field(&name, field).await?)
                }
                _ => debug!(field = %name, "Ignoring form field"),
            }
        }
        Ok(form)
    }
}

async fn parse_field<T: FromStr>(name: &str, field: Field<'_>) -> Result<T> {
    let text = field.text().await?;
    text.trim()
        .parse()
        .map_err(|_| ApiError::InvalidRequest(format!("Invalid value for '{name}': {text}")))
}

/// Validates the upload, runs the edit and encodes the result.
pub async fn handle_edit(resource: Arc<ModelResource>, form: EditForm) -> Result<ImageResponse> {
    let model = form
        .model
        .as_deref()
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .unwrap_or(SERVED_MODEL_ID);
    if model != SERVED_MODEL_ID {
        return Err(ApiError::InvalidRequest(format!(
            "Model '{model}' not found. Available models: {SERVED_MODEL_ID}"
        )));
    }

    let prompt = form.prompt.unwrap_or_default();
    if prompt.trim().is_empty() {
        return Err(ApiError::InvalidRequest(
            "Missing required field: prompt".to_string(),
        ));
    }
    if let Some(steps) = form.num_inference_steps {
        if !(1..=MAX_INFERENCE_STEPS).contains(&steps) {
            return Err(ApiError::InvalidRequest(format!(
                "num_inference_steps must be between 1 and {MAX_INFERENCE_STEPS}, got {steps}"
            )));
        }
    }
    if let Some(scale) = form.guidance_scale {
        if !scale.is_finite() || scale < 0.0 {
            return Err(ApiError::InvalidRequest(format!(
                "guidance_scale must be a finite non-negative number, got {scale}"
            )));
        }
    }

    let bytes = form
        .image
        .ok_or_else(|| ApiError::InvalidRequest("Missing required field: image".to_string()))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid image format: {e}")))?;

    info!(
        width = image.width(),
        height = image.height(),
        "Received edit request"
    );

    let request = EditRequest {
        image,
        prompt,
        seed: form.seed,
        guidance_scale: form.guidance_scale,
        steps: form.num_inference_steps,
        negative_prompt: form.negative_prompt,
    };
    let b64_json = tokio::task::spawn_blocking(move || -> Result<String> {
        let edited = resource.edit(request)?;
        Ok(encode_png_base64(&edited)?)
    })
    .await
    .context("edit task panicked")
    .map_err(ApiError::Internal)??;

    Ok(ImageResponse {
        created: chrono::Utc::now().timestamp(),
        data: vec![ImageData { b64_json }],
    })
}

fn encode_png_base64(image: &DynamicImage) -> anyhow::Result<String> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

pub async fn edit_image(
    State(state): State<Arc<AppState>>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<ImageResponse>> {
    let form = EditForm::from_multipart(multipart?).await?;
    let response = handle_edit(state.resource.clone(), form).await?;
    Ok(Json(response))
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        object: "list".to_string(),
        data: vec![ModelInfo {
            id: SERVED_MODEL_ID.to_string(),
            object: "model".to_string(),
            created: state.started_at,
            owned_by: SERVED_MODEL_OWNER.to_string(),
        }],
    })
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        model_loaded: state.resource.is_loaded(),
        device: state.resource.device().to_string(),
    })
}

pub async fn root() -> Json<ServiceDescriptor> {
    Json(ServiceDescriptor {
        name: "Retouch Image Edit API".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        endpoints: [EDITS_PATH, MODELS_PATH, HEALTH_PATH]
            .into_iter()
            .map(str::to_string)
            .collect(),
    })
}

pub async fn not_found() -> ApiError {
    ApiError::NotFound("Not found".to_string())
}

pub async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed("Method not allowed".to_string())
}
