use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::encoder::encode_data_uri;
use crate::error::ServiceError;
use crate::settings::{mask_key, Settings};

const PROVIDER: &str = "image generation";

#[derive(Debug, Serialize)]
struct ImageGenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    size: &'a str,
    response_format: &'static str,
    sequential_image_generation: &'static str,
    stream: bool,
    watermark: bool,
}

#[derive(Debug, Deserialize)]
struct ImageGenerationResponse {
    data: Option<Vec<ImageDatum>>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    url: Option<String>,
}

/// Preview image produced from an outfit description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedImage {
    pub image_url: String,
    pub description: String,
}

#[derive(Clone)]
pub struct GenerationClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    size: String,
    watermark: bool,
    api_key: Option<String>,
}

impl GenerationClient {
    pub fn new(http: reqwest::Client, settings: &Settings) -> Self {
        Self {
            http,
            endpoint: settings.generation_endpoint.clone(),
            model: settings.generation_model.clone(),
            size: settings.generation_size.clone(),
            watermark: settings.generation_watermark,
            api_key: settings.generation_api_key.clone(),
        }
    }

    /// Request one image for `prompt`, optionally conditioned on `source`
    /// (image-to-image). Returns the first URL the provider lists.
    #[instrument(skip(self, prompt), fields(endpoint = %self.endpoint, model = %self.model))]
    pub async fn generate(
        &self,
        prompt: &str,
        source: Option<&Path>,
    ) -> Result<GeneratedImage, ServiceError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ServiceError::Validation(
                "missing suggested_outfit_description".to_string(),
            ));
        }
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ServiceError::MissingCredential(PROVIDER))?;
        let image = match source {
            Some(path) => Some(encode_data_uri(path).await?),
            None => None,
        };

        let body = ImageGenerationRequest {
            model: &self.model,
            prompt,
            image,
            size: &self.size,
            response_format: "url",
            sequential_image_generation: "disabled",
            stream: false,
            watermark: self.watermark,
        };

        info!(
            api_key = %mask_key(api_key),
            image_to_image = body.image.is_some(),
            prompt,
            "calling image generation"
        );
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|source| {
                warn!(error = %source, "image generation request failed");
                ServiceError::Unavailable { provider: PROVIDER, source }
            })?;

        let status = resp.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "image generation returned an error status");
            return Err(ServiceError::Upstream {
                provider: PROVIDER,
                status: status.as_u16(),
            });
        }

        let parsed: ImageGenerationResponse = resp.json().await.map_err(|e| {
            ServiceError::MalformedResponse(format!("image generation response unreadable: {e}"))
        })?;
        let url = parsed
            .data
            .unwrap_or_default()
            .into_iter()
            .find_map(|d| d.url.filter(|u| !u.is_empty()))
            .ok_or_else(|| {
                ServiceError::MalformedResponse(
                    "image generation response contained no image URL".to_string(),
                )
            })?;

        info!(url = %url, "image generated");
        Ok(GeneratedImage {
            image_url: url,
            description: prompt.to_string(),
        })
    }
}
