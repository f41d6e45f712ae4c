#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use facefind::embedding::from_wire;
use facefind::fetch::{FetchError, ImageSource};
use facefind::indexer::StoreSink;
use facefind::provider::{DescribedFace, EmbeddingProvider, ProviderError};
use facefind::remote::GalleryFile;
use facefind::store::EmbeddingStore;
use facefind::{Detection, Embedding};
use image::DynamicImage;

pub fn files(n: usize) -> Vec<GalleryFile> {
    (0..n)
        .map(|i| GalleryFile {
            id: format!("f{i}"),
            name: format!("photo{i}.jpg"),
            full: format!("https://img.example/{i}"),
            ..Default::default()
        })
        .collect()
}

pub fn emb(values: &[f32]) -> Embedding {
    from_wire(values.to_vec()).unwrap()
}

pub fn ids(store: &EmbeddingStore) -> Vec<String> {
    store.iter().map(|r| r.file_id.clone()).collect()
}

fn index_of(file: &GalleryFile) -> u32 {
    file.id.trim_start_matches('f').parse().unwrap()
}

/// Serves a blank image whose width encodes the file index (`width = index + 1`).
#[derive(Default)]
pub struct FakeSource {
    pub failing: HashSet<String>,
    pub hanging: HashSet<String>,
    pub fetched: Mutex<Vec<String>>,
    active: AtomicUsize,
    pub peak_active: AtomicUsize,
}

impl FakeSource {
    pub fn failing(ids: &[&str]) -> Self {
        Self {
            failing: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn hanging(ids: &[&str]) -> Self {
        Self {
            hanging: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn fetch_count(&self, id: &str) -> usize {
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.as_str() == id)
            .count()
    }
}

#[async_trait]
impl ImageSource for FakeSource {
    async fn fetch(&self, file: &GalleryFile) -> Result<DynamicImage, FetchError> {
        self.fetched.lock().unwrap().push(file.id.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.hanging.contains(&file.id) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&file.id) {
            return Err(FetchError::NoUrl(file.id.clone()));
        }
        Ok(DynamicImage::new_rgb8(index_of(file) + 1, 1))
    }
}

/// One face per image at `[index, 0]`, except for the listed indices.
#[derive(Default)]
pub struct FakeProvider {
    pub faceless: HashSet<u32>,
    pub two_faces: HashSet<u32>,
}

impl FakeProvider {
    pub fn faceless(indices: &[u32]) -> Self {
        Self {
            faceless: indices.iter().copied().collect(),
            ..Default::default()
        }
    }
}

pub fn face(embedding: Embedding, score: f32) -> DescribedFace {
    DescribedFace {
        detection: Detection {
            bbox: [0.0, 0.0, 1.0, 1.0],
            score,
            landmarks: [0.0; 10],
        },
        embedding,
    }
}

#[async_trait]
impl EmbeddingProvider for FakeProvider {
    async fn detect(&self, image: DynamicImage) -> Result<Vec<Detection>, ProviderError> {
        Ok(self
            .describe_all(image)
            .await?
            .into_iter()
            .map(|f| f.detection)
            .collect())
    }

    async fn describe_all(&self, image: DynamicImage) -> Result<Vec<DescribedFace>, ProviderError> {
        let index = image.width() - 1;
        if self.faceless.contains(&index) {
            return Ok(vec![]);
        }
        let mut faces = vec![face(emb(&[index as f32, 0.0]), 0.9)];
        if self.two_faces.contains(&index) {
            faces.push(face(emb(&[index as f32, 1.0]), 0.8));
        }
        Ok(faces)
    }
}

/// Provider with a fixed answer for every image.
pub struct FixedProvider(pub Vec<DescribedFace>);

#[async_trait]
impl EmbeddingProvider for FixedProvider {
    async fn detect(&self, _image: DynamicImage) -> Result<Vec<Detection>, ProviderError> {
        Ok(self.0.iter().map(|f| f.detection.clone()).collect())
    }

    async fn describe_all(&self, _image: DynamicImage) -> Result<Vec<DescribedFace>, ProviderError> {
        Ok(self.0.clone())
    }
}

/// Remembers every snapshot it is asked to save.
#[derive(Default)]
pub struct RecordingSink {
    pub snapshots: Mutex<Vec<Vec<String>>>,
    pub fail: bool,
}

impl RecordingSink {
    pub fn saves(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }
}

#[async_trait]
impl StoreSink for RecordingSink {
    async fn save(&self, store: &EmbeddingStore) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("backend down");
        }
        self.snapshots.lock().unwrap().push(ids(store));
        Ok(())
    }
}

pub fn by_id(store: &EmbeddingStore) -> HashMap<String, usize> {
    store
        .iter()
        .map(|r| (r.file_id.clone(), r.embeddings.len()))
        .collect()
}
