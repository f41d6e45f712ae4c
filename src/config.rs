use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use directories::ProjectDirs;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::indexer::{EmptyFacePolicy, IndexOptions, PersistMode};
use crate::matcher::{Matcher, DEFAULT_DISTANCE_THRESHOLD};
use crate::remote::ImageVariant;

static DIRS: Lazy<Option<ProjectDirs>> = Lazy::new(|| ProjectDirs::from("", "", "facefind"));

pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| match option_env!("FACEFIND_CONFIG_PATH") {
    Some(path) => PathBuf::from(path),
    None => DIRS
        .as_ref()
        .map(|d| d.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("facefind.toml")),
});

pub static MODEL_CACHE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    DIRS.as_ref()
        .map(|d| d.cache_dir().join("models"))
        .unwrap_or_else(|| PathBuf::from("models"))
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Gallery script endpoint.
    pub endpoint: Option<String>,
    pub threshold: f32,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub image_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Resize proxy base URL, e.g. `https://images.weserv.nl/`.
    pub image_proxy: Option<String>,
    pub proxy_width: u32,
    pub image_variant: ImageVariant,
    pub empty_face_policy: EmptyFacePolicy,
    pub persist_every_batch: bool,
    pub model_base_url: String,
    pub model_dir: Option<PathBuf>,
    pub detector_score_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            threshold: DEFAULT_DISTANCE_THRESHOLD,
            batch_size: crate::indexer::DEFAULT_BATCH_SIZE,
            batch_delay_ms: crate::indexer::DEFAULT_BATCH_DELAY.as_millis() as u64,
            image_timeout_secs: crate::indexer::DEFAULT_IMAGE_TIMEOUT.as_secs(),
            request_timeout_secs: 30,
            image_proxy: None,
            proxy_width: 800,
            image_variant: ImageVariant::default(),
            empty_face_policy: EmptyFacePolicy::default(),
            persist_every_batch: false,
            model_base_url: facefind_vision::model::DEFAULT_MODEL_BASE_URL.to_string(),
            model_dir: None,
            detector_score_threshold: facefind_vision::pipeline::DEFAULT_SCORE_THRESHOLD,
            nms_threshold: facefind_vision::pipeline::DEFAULT_NMS_THRESHOLD,
        }
    }
}

impl Config {
    pub fn endpoint(&self) -> Result<&str> {
        self.endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .context("no gallery endpoint configured, run `facefind endpoint <url>` first")
    }

    pub fn matcher(&self) -> Matcher {
        Matcher::new(self.threshold)
    }

    pub fn index_options(&self) -> IndexOptions {
        IndexOptions {
            batch_size: self.batch_size.max(1),
            batch_delay: Duration::from_millis(self.batch_delay_ms),
            image_timeout: Duration::from_secs(self.image_timeout_secs.max(1)),
            empty_faces: self.empty_face_policy,
            persist: if self.persist_every_batch {
                PersistMode::EveryBatch
            } else {
                PersistMode::OnCompletion
            },
            save_on_cancel: true,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(|| MODEL_CACHE_DIR.clone())
    }
}

/// Accept an endpoint either as a URL or base64-encoded. Anything that does
/// not start with `http` and decodes to UTF-8 is taken as encoded.
pub fn decode_endpoint(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with("http") {
        return raw.to_string();
    }
    let engines = [
        &base64::engine::general_purpose::STANDARD,
        &base64::engine::general_purpose::URL_SAFE,
    ];
    engines
        .iter()
        .find_map(|engine| engine.decode(raw).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| raw.to_string())
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
