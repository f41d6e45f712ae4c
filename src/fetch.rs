use async_trait::async_trait;
use image::DynamicImage;
use log::debug;
use reqwest::{Client, Url};
use thiserror::Error;

use crate::remote::{GalleryFile, ImageVariant};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("file {0} has no image url")]
    NoUrl(String),
    #[error("invalid image url {0:?}")]
    InvalidUrl(String),
    #[error("image download failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("decode task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Where indexing gets pixels from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, file: &GalleryFile) -> Result<DynamicImage, FetchError>;
}

/// Downloads gallery images over HTTP, optionally through a resize proxy
/// that takes the source as `url` and the target width as `w`.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: Client,
    proxy: Option<Url>,
    proxy_width: u32,
    variant: ImageVariant,
}

impl ImageFetcher {
    pub fn new(client: Client, variant: ImageVariant) -> Self {
        Self {
            client,
            proxy: None,
            proxy_width: 0,
            variant,
        }
    }

    pub fn with_proxy(mut self, proxy: &str, width: u32) -> Result<Self, FetchError> {
        let url = Url::parse(proxy).map_err(|_| FetchError::InvalidUrl(proxy.to_string()))?;
        self.proxy = Some(url);
        self.proxy_width = width;
        Ok(self)
    }

    /// URL actually requested for `file`.
    pub fn request_url(&self, file: &GalleryFile) -> Result<Url, FetchError> {
        let source = file
            .image_url(self.variant)
            .ok_or_else(|| FetchError::NoUrl(file.id.clone()))?;
        match &self.proxy {
            Some(proxy) => {
                let mut url = proxy.clone();
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("url", source);
                    if self.proxy_width > 0 {
                        query.append_pair("w", &self.proxy_width.to_string());
                    }
                }
                Ok(url)
            }
            None => Url::parse(source).map_err(|_| FetchError::InvalidUrl(source.to_string())),
        }
    }
}

#[async_trait]
impl ImageSource for ImageFetcher {
    async fn fetch(&self, file: &GalleryFile) -> Result<DynamicImage, FetchError> {
        let url = self.request_url(file)?;
        debug!("fetching {} from {}", file.id, url);
        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let image = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes)).await??;
        Ok(image)
    }
}
