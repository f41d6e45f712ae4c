//! Client for the script-backed gallery endpoint: file listing plus the
//! wholesale load/save of the embedding store.

use log::{debug, info, warn};
use reqwest::{Client, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::store::EmbeddingStore;

pub const LOAD_ACTION: &str = "getDB";
pub const SAVE_ACTION: &str = "saveDB";
pub const FOLDER_PARAM: &str = "folderId";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} answered {status}")]
    Status { status: StatusCode, url: String },
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Which of a file's URLs gets fetched for indexing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageVariant {
    #[default]
    Full,
    Thumbnail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub thumbnail: String,
    #[serde(default)]
    pub full: String,
    #[serde(default)]
    pub download_url: String,
}

impl GalleryFile {
    /// Preferred URL for `variant`, falling back to the other variant and then
    /// the download link.
    pub fn image_url(&self, variant: ImageVariant) -> Option<&str> {
        let (first, second) = match variant {
            ImageVariant::Full => (&self.full, &self.thumbnail),
            ImageVariant::Thumbnail => (&self.thumbnail, &self.full),
        };
        [first, second, &self.download_url]
            .into_iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(default)]
    pub files: Vec<GalleryFile>,
    #[serde(default)]
    pub folders: Vec<Folder>,
}

/// What a store load produced. `Unavailable` and `Empty` both disable search
/// but mean different things to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreState {
    Unavailable,
    Empty,
    Ready(EmbeddingStore),
}

impl StoreState {
    pub fn from_store(store: EmbeddingStore) -> Self {
        if store.is_empty() {
            Self::Empty
        } else {
            Self::Ready(store)
        }
    }

    pub fn store(&self) -> Option<&EmbeddingStore> {
        match self {
            Self::Ready(store) => Some(store),
            _ => None,
        }
    }

    pub fn is_searchable(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn into_store(self) -> EmbeddingStore {
        match self {
            Self::Ready(store) => store,
            _ => EmbeddingStore::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteClient {
    client: Client,
    endpoint: Url,
}

impl RemoteClient {
    pub fn new(client: Client, endpoint: &str) -> Result<Self, RemoteError> {
        let endpoint = Url::parse(endpoint.trim())
            .map_err(|_| RemoteError::InvalidEndpoint(endpoint.to_string()))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(RemoteError::InvalidEndpoint(endpoint.to_string()));
        }
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url_with(&self, key: &str, value: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair(key, value);
        url
    }

    fn check(url: &Url, response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                status,
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, RemoteError> {
        debug!("GET {}", url);
        let response = self.client.get(url.clone()).send().await?;
        let body = Self::check(&url, response)?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// List gallery files, optionally inside one folder.
    pub async fn list(&self, folder: Option<&str>) -> Result<Listing, RemoteError> {
        let url = match folder {
            Some(id) => self.url_with(FOLDER_PARAM, id),
            None => self.endpoint.clone(),
        };
        let listing: Option<Listing> = self.get_json(url).await?;
        Ok(listing.unwrap_or_default())
    }

    pub async fn load_store(&self) -> Result<EmbeddingStore, RemoteError> {
        let store: EmbeddingStore = self.get_json(self.url_with("action", LOAD_ACTION)).await?;
        info!(
            "loaded embedding store: {} records, {} faces",
            store.len(),
            store.face_count()
        );
        Ok(store)
    }

    /// Like [`load_store`](Self::load_store) but never fails; errors leave
    /// search disabled instead.
    pub async fn load_store_or_empty(&self) -> StoreState {
        match self.load_store().await {
            Ok(store) => StoreState::from_store(store),
            Err(e) => {
                warn!("embedding store unavailable: {}", e);
                StoreState::Unavailable
            }
        }
    }

    /// Overwrite the remote snapshot with the full store.
    pub async fn save_store(&self, store: &EmbeddingStore) -> Result<(), RemoteError> {
        let url = self.url_with("action", SAVE_ACTION);
        debug!("POST {} ({} records)", url, store.len());
        let response = self.client.post(url.clone()).json(store).send().await?;
        Self::check(&url, response)?;
        info!(
            "saved embedding store: {} records, {} faces",
            store.len(),
            store.face_count()
        );
        Ok(())
    }
}
