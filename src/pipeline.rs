use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::encoder::encode_data_uri;
use crate::error::ServiceError;
use crate::generation::{GeneratedImage, GenerationClient};
use crate::palette::AnalysisResult;
use crate::settings::Settings;
use crate::upload::{UploadStore, UploadedFile};
use crate::vision::VisionClient;

/// Upload, analyze and generate, shared by every transport.
pub struct Pipeline {
    settings: Settings,
    store: Arc<UploadStore>,
    vision: VisionClient,
    generation: GenerationClient,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            store: Arc::new(UploadStore::from_settings(&settings)),
            vision: VisionClient::new(http.clone(), &settings),
            generation: GenerationClient::new(http, &settings),
            settings,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<UploadStore> {
        &self.store
    }

    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn upload(
        &self,
        original_name: &str,
        mime: Option<&str>,
        bytes: &[u8],
    ) -> Result<UploadedFile, ServiceError> {
        self.store.save(original_name, mime, bytes).await
    }

    #[instrument(skip(self))]
    pub async fn analyze(&self, file_path: &str) -> Result<AnalysisResult, ServiceError> {
        if file_path.trim().is_empty() {
            return Err(ServiceError::Validation("missing filePath".to_string()));
        }
        let path = self.store.resolve(file_path).await?;
        let data_uri = encode_data_uri(&path).await?;
        let result = self.vision.analyze(&data_uri).await?;
        info!(
            colors = ?result.dominant_colors,
            harmonious = result.is_harmonious,
            fallback = result.fallback,
            "analysis finished"
        );
        Ok(result)
    }

    #[instrument(skip(self, description))]
    pub async fn generate(
        &self,
        description: &str,
        original_image_path: Option<&str>,
    ) -> Result<GeneratedImage, ServiceError> {
        if description.trim().is_empty() {
            return Err(ServiceError::Validation(
                "missing suggested_outfit_description".to_string(),
            ));
        }
        let source = match original_image_path.map(str::trim).filter(|p| !p.is_empty()) {
            Some(p) => Some(self.store.resolve(p).await?),
            None => None,
        };
        self.generation
            .generate(description, source.as_deref())
            .await
    }
}
