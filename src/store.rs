use std::collections::HashMap;

use log::warn;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::embedding::{self, EmbeddingError};
use crate::Embedding;

/// Faces found in one gallery image.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub file_id: String,
    pub embeddings: Vec<Embedding>,
}

impl EmbeddingRecord {
    pub fn new(file_id: impl Into<String>, embeddings: Vec<Embedding>) -> Self {
        Self {
            file_id: file_id.into(),
            embeddings,
        }
    }
}

/// Record as exchanged with the store endpoint: `{"fileId": .., "faces": [[..]]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRecord {
    pub file_id: String,
    #[serde(default)]
    pub faces: Vec<Vec<f32>>,
}

impl From<&EmbeddingRecord> for WireRecord {
    fn from(record: &EmbeddingRecord) -> Self {
        Self {
            file_id: record.file_id.clone(),
            faces: record.embeddings.iter().map(embedding::to_wire).collect(),
        }
    }
}

impl TryFrom<WireRecord> for EmbeddingRecord {
    type Error = EmbeddingError;

    fn try_from(wire: WireRecord) -> Result<Self, Self::Error> {
        let embeddings = wire
            .faces
            .into_iter()
            .map(embedding::from_wire)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(wire.file_id, embeddings))
    }
}

/// In-memory embedding index. Insertion order is kept and each file id
/// appears at most once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingStore {
    records: Vec<EmbeddingRecord>,
    positions: HashMap<String, usize>,
}

impl EmbeddingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total number of stored embeddings across all records.
    pub fn face_count(&self) -> usize {
        self.records.iter().map(|r| r.embeddings.len()).sum()
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.positions.contains_key(file_id)
    }

    pub fn get(&self, file_id: &str) -> Option<&EmbeddingRecord> {
        self.positions.get(file_id).map(|&i| &self.records[i])
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &EmbeddingRecord> {
        self.records.iter()
    }

    /// Append a record. Returns `false`, leaving the store untouched, when the
    /// file id is already present.
    pub fn insert(&mut self, record: EmbeddingRecord) -> bool {
        if self.contains(&record.file_id) {
            return false;
        }
        self.positions
            .insert(record.file_id.clone(), self.records.len());
        self.records.push(record);
        true
    }

    /// Build from a remote snapshot. Duplicate ids keep their first record;
    /// records carrying malformed vectors are dropped so they get re-indexed.
    pub fn from_wire(wire: Vec<WireRecord>) -> Self {
        let mut store = Self::new();
        for record in wire {
            let file_id = record.file_id.clone();
            match EmbeddingRecord::try_from(record) {
                Ok(record) => {
                    if !store.insert(record) {
                        warn!("duplicate record for {} in snapshot, keeping the first", file_id);
                    }
                }
                Err(e) => warn!("dropping record for {}: {}", file_id, e),
            }
        }
        store
    }

    pub fn to_wire(&self) -> Vec<WireRecord> {
        self.records.iter().map(WireRecord::from).collect()
    }
}

impl Serialize for EmbeddingStore {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.records.iter().map(WireRecord::from))
    }
}

impl<'de> Deserialize<'de> for EmbeddingStore {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = Option::<Vec<WireRecord>>::deserialize(deserializer)?.unwrap_or_default();
        Ok(Self::from_wire(wire))
    }
}
