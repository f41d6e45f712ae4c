//! Embedding provider seam and its one-time initialisation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image::DynamicImage;
use log::{info, warn};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::{Detection, Embedding};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to load face models: {0:#}")]
    Load(anyhow::Error),
    #[error("face inference failed: {0:#}")]
    Inference(anyhow::Error),
    #[error("inference task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct DescribedFace {
    pub detection: Detection,
    pub embedding: Embedding,
}

/// Turns images into face boxes and embeddings.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn detect(&self, image: DynamicImage) -> Result<Vec<Detection>, ProviderError>;

    /// Every face in the image with its embedding.
    async fn describe_all(&self, image: DynamicImage) -> Result<Vec<DescribedFace>, ProviderError>;
}

/// Produces a ready provider, typically by fetching and loading weights.
#[async_trait]
pub trait ProviderLoader: Send + Sync {
    type Provider: EmbeddingProvider;

    async fn load(&self) -> Result<Self::Provider, ProviderError>;
}

#[derive(Debug, Clone)]
pub enum ProviderState {
    Unloaded,
    Loading,
    Ready,
    Failed(Arc<ProviderError>),
}

type LoadOutcome<P> = Result<Arc<P>, Arc<ProviderError>>;

/// Counts a load as in flight until dropped, including when the loading
/// future is cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Lazily loads a provider exactly once. Concurrent callers of
/// [`ensure_ready`](Self::ensure_ready) share one load; a failure is kept and
/// handed to every later caller.
pub struct EmbeddingProviderHandle<L: ProviderLoader> {
    loader: L,
    in_flight: AtomicUsize,
    outcome: OnceCell<LoadOutcome<L::Provider>>,
}

impl<L: ProviderLoader> EmbeddingProviderHandle<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            in_flight: AtomicUsize::new(0),
            outcome: OnceCell::new(),
        }
    }

    pub fn state(&self) -> ProviderState {
        match self.outcome.get() {
            Some(Ok(_)) => ProviderState::Ready,
            Some(Err(e)) => ProviderState::Failed(Arc::clone(e)),
            None if self.in_flight.load(Ordering::Acquire) > 0 => ProviderState::Loading,
            None => ProviderState::Unloaded,
        }
    }

    pub async fn ensure_ready(&self) -> LoadOutcome<L::Provider> {
        self.outcome
            .get_or_init(|| async {
                let _loading = InFlight::enter(&self.in_flight);
                info!("loading face models");
                match self.loader.load().await {
                    Ok(provider) => {
                        info!("face models ready");
                        Ok(Arc::new(provider))
                    }
                    Err(e) => {
                        warn!("face models unavailable: {}", e);
                        Err(Arc::new(e))
                    }
                }
            })
            .await
            .clone()
    }
}
