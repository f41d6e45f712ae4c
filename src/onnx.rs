//! [`EmbeddingProvider`] backed by the YuNet + SFace ONNX pipeline.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use facefind_vision::{model, Pipeline};
use image::DynamicImage;
use log::{debug, info};
use reqwest::Client;

use crate::provider::{DescribedFace, EmbeddingProvider, ProviderError, ProviderLoader};
use crate::Detection;

/// Runs the synchronous pipeline on the blocking pool, one inference at a time.
pub struct OnnxProvider {
    pipeline: Arc<Mutex<Pipeline>>,
}

impl OnnxProvider {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(Mutex::new(pipeline)),
        }
    }

    async fn with_pipeline<T, F>(&self, image: DynamicImage, f: F) -> Result<T, ProviderError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Pipeline, &DynamicImage) -> anyhow::Result<T> + Send + 'static,
    {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || {
            let mut guard = pipeline
                .lock()
                .map_err(|_| anyhow::anyhow!("face pipeline poisoned by an earlier panic"))?;
            f(&mut guard, &image)
        })
        .await?
        .map_err(ProviderError::Inference)
    }
}

#[async_trait]
impl EmbeddingProvider for OnnxProvider {
    async fn detect(&self, image: DynamicImage) -> Result<Vec<Detection>, ProviderError> {
        self.with_pipeline(image, |pipeline, img| pipeline.detect(img))
            .await
    }

    async fn describe_all(&self, image: DynamicImage) -> Result<Vec<DescribedFace>, ProviderError> {
        let faces = self
            .with_pipeline(image, |pipeline, img| pipeline.describe_all(img))
            .await?;
        Ok(faces
            .into_iter()
            .map(|(detection, embedding)| DescribedFace {
                detection,
                embedding,
            })
            .collect())
    }
}

/// Fetches missing weights from the model CDN into `model_dir`, then builds
/// the pipeline.
pub struct OnnxLoader {
    client: Client,
    base_url: String,
    model_dir: PathBuf,
    score_threshold: f32,
    nms_threshold: f32,
}

impl OnnxLoader {
    pub fn new(client: Client, base_url: impl Into<String>, model_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model_dir: model_dir.into(),
            score_threshold: facefind_vision::pipeline::DEFAULT_SCORE_THRESHOLD,
            nms_threshold: facefind_vision::pipeline::DEFAULT_NMS_THRESHOLD,
        }
    }

    pub fn with_thresholds(mut self, score_threshold: f32, nms_threshold: f32) -> Self {
        self.score_threshold = score_threshold;
        self.nms_threshold = nms_threshold;
        self
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    async fn fetch_weights(&self) -> anyhow::Result<()> {
        let missing = model::missing_assets(&self.model_dir);
        if missing.is_empty() {
            debug!("all model weights present in {}", self.model_dir.display());
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.model_dir)
            .await
            .with_context(|| format!("creating {}", self.model_dir.display()))?;

        for asset in missing {
            let url = asset.remote_url(&self.base_url);
            let path = asset.local_path(&self.model_dir);
            info!("downloading {} from {}", asset.file_name, url);

            let bytes = self
                .client
                .get(&url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .with_context(|| format!("requesting {url}"))?
                .bytes()
                .await
                .with_context(|| format!("downloading {url}"))?;

            // write beside the target first so a partial file never looks complete
            let partial = path.with_extension("onnx.part");
            tokio::fs::write(&partial, &bytes)
                .await
                .with_context(|| format!("writing {}", partial.display()))?;
            tokio::fs::rename(&partial, &path)
                .await
                .with_context(|| format!("moving weights into {}", path.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderLoader for OnnxLoader {
    type Provider = OnnxProvider;

    async fn load(&self) -> Result<OnnxProvider, ProviderError> {
        self.fetch_weights().await.map_err(ProviderError::Load)?;

        let dir = self.model_dir.clone();
        let (score, nms) = (self.score_threshold, self.nms_threshold);
        let pipeline = tokio::task::spawn_blocking(move || {
            Pipeline::from_dir(&dir).map(|p| p.with_thresholds(score, nms))
        })
        .await?
        .map_err(ProviderError::Load)?;

        Ok(OnnxProvider::new(pipeline))
    }
}
