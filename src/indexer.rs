//! Incremental, batched and cancellable build of the embedding store.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::fetch::{FetchError, ImageSource};
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::remote::{GalleryFile, RemoteClient};
use crate::store::{EmbeddingRecord, EmbeddingStore};
use crate::Embedding;

pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_IMAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// What to do with an image in which no face was found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyFacePolicy {
    /// Leave it out of the store; it is retried on the next run.
    #[default]
    Skip,
    /// Store it with no embeddings so later runs skip it.
    Record,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PersistMode {
    #[default]
    OnCompletion,
    EveryBatch,
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub image_timeout: Duration,
    pub empty_faces: EmptyFacePolicy,
    pub persist: PersistMode,
    /// Save what was gathered when the run is cancelled.
    pub save_on_cancel: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: DEFAULT_BATCH_DELAY,
            image_timeout: DEFAULT_IMAGE_TIMEOUT,
            empty_faces: EmptyFacePolicy::default(),
            persist: PersistMode::default(),
            save_on_cancel: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Files of `files` not yet in `store`, in listing order. An id listed more
/// than once is returned once.
pub fn pending_files<'a>(files: &'a [GalleryFile], store: &EmbeddingStore) -> Vec<&'a GalleryFile> {
    let mut queued = HashSet::new();
    files
        .iter()
        .filter(|f| !store.contains(&f.id) && queued.insert(f.id.as_str()))
        .collect()
}

/// Receives the full store whenever the indexer persists.
#[async_trait]
pub trait StoreSink: Send + Sync {
    async fn save(&self, store: &EmbeddingStore) -> anyhow::Result<()>;
}

#[async_trait]
impl StoreSink for RemoteClient {
    async fn save(&self, store: &EmbeddingStore) -> anyhow::Result<()> {
        Ok(self.save_store(store).await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    /// 1-based index of the batch that just finished.
    pub batch: usize,
    pub total_batches: usize,
    pub processed: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub indexed: usize,
    pub skipped_existing: usize,
    pub no_face: usize,
    pub failed: usize,
    pub batches: usize,
    pub cancelled: bool,
    pub saves: usize,
    pub save_failures: usize,
}

enum Outcome {
    Faces(Vec<Embedding>),
    NoFace,
}

pub struct Indexer<'a> {
    source: &'a dyn ImageSource,
    provider: &'a dyn EmbeddingProvider,
    options: IndexOptions,
}

impl<'a> Indexer<'a> {
    pub fn new(
        source: &'a dyn ImageSource,
        provider: &'a dyn EmbeddingProvider,
        options: IndexOptions,
    ) -> Self {
        Self {
            source,
            provider,
            options,
        }
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    pub async fn run(
        &self,
        files: &[GalleryFile],
        store: &mut EmbeddingStore,
        sink: Option<&dyn StoreSink>,
        cancel: &CancellationToken,
    ) -> IndexReport {
        self.run_with_progress(files, store, sink, cancel, |_| {})
            .await
    }

    /// Index every file not yet in `store`. `on_batch` runs after each batch
    /// has been merged.
    pub async fn run_with_progress<F>(
        &self,
        files: &[GalleryFile],
        store: &mut EmbeddingStore,
        sink: Option<&dyn StoreSink>,
        cancel: &CancellationToken,
        mut on_batch: F,
    ) -> IndexReport
    where
        F: FnMut(&BatchProgress),
    {
        let mut report = IndexReport::default();
        let initial_len = store.len();
        let pending = pending_files(files, store);
        report.skipped_existing = files.len() - pending.len();

        let batch_size = self.options.batch_size.max(1);
        let total_batches = pending.len().div_ceil(batch_size);
        info!(
            "indexing {} new images in {} batches ({} already indexed)",
            pending.len(),
            total_batches,
            report.skipped_existing
        );

        let mut processed = 0;
        for (i, batch) in pending.chunks(batch_size).enumerate() {
            if i > 0 && !self.options.batch_delay.is_zero() {
                tokio::time::sleep(self.options.batch_delay).await;
            }
            if cancel.is_cancelled() {
                info!("indexing stopped before batch {}/{}", i + 1, total_batches);
                report.cancelled = true;
                break;
            }

            let results = join_all(batch.iter().map(|file| async move {
                (*file, self.index_with_timeout(file).await)
            }))
            .await;

            let len_before = store.len();
            for (file, result) in results {
                match result {
                    Ok(Outcome::Faces(embeddings)) => {
                        debug!("{}: {} faces", file.id, embeddings.len());
                        store.insert(EmbeddingRecord::new(file.id.clone(), embeddings));
                        report.indexed += 1;
                    }
                    Ok(Outcome::NoFace) => {
                        debug!("{}: no face", file.id);
                        report.no_face += 1;
                        if self.options.empty_faces == EmptyFacePolicy::Record {
                            store.insert(EmbeddingRecord::new(file.id.clone(), Vec::new()));
                        }
                    }
                    Err(e) => {
                        warn!("skipping {} ({}): {}", file.id, file.name, e);
                        report.failed += 1;
                    }
                }
            }

            processed += batch.len();
            report.batches += 1;
            let progress = BatchProgress {
                batch: i + 1,
                total_batches,
                processed,
                pending: pending.len() - processed,
            };
            info!(
                "batch {}/{}: {} of {} images processed",
                progress.batch,
                progress.total_batches,
                progress.processed,
                pending.len()
            );
            on_batch(&progress);

            if self.options.persist == PersistMode::EveryBatch && store.len() > len_before {
                Self::persist(sink, store, &mut report).await;
            }
        }

        let wants_final_save = self.options.persist == PersistMode::OnCompletion
            && (!report.cancelled || self.options.save_on_cancel);
        if wants_final_save && store.len() > initial_len {
            Self::persist(sink, store, &mut report).await;
        }

        info!(
            "indexing {}: {} indexed, {} without faces, {} failed, {} skipped",
            if report.cancelled { "cancelled" } else { "finished" },
            report.indexed,
            report.no_face,
            report.failed,
            report.skipped_existing
        );
        report
    }

    async fn persist(sink: Option<&dyn StoreSink>, store: &EmbeddingStore, report: &mut IndexReport) {
        let Some(sink) = sink else {
            return;
        };
        match sink.save(store).await {
            Ok(()) => report.saves += 1,
            Err(e) => {
                warn!("saving embedding store failed: {:#}", e);
                report.save_failures += 1;
            }
        }
    }

    async fn index_with_timeout(&self, file: &GalleryFile) -> Result<Outcome, IndexError> {
        let timeout = self.options.image_timeout;
        tokio::time::timeout(timeout, self.index_one(file))
            .await
            .map_err(|_| IndexError::Timeout(timeout))?
    }

    async fn index_one(&self, file: &GalleryFile) -> Result<Outcome, IndexError> {
        let image = self.source.fetch(file).await?;
        let faces = self.provider.describe_all(image).await?;
        if faces.is_empty() {
            return Ok(Outcome::NoFace);
        }
        Ok(Outcome::Faces(
            faces.into_iter().map(|f| f.embedding).collect(),
        ))
    }
}
