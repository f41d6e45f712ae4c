use image::DynamicImage;
use log::{debug, info};

use crate::matcher::{MatchSet, Matcher};
use crate::provider::{DescribedFace, EmbeddingProvider, ProviderError};
use crate::remote::{GalleryFile, StoreState};

#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    /// No usable store: never indexed, or it could not be loaded.
    StoreNotBuilt,
    /// The reference photo has no detectable face; nothing was matched.
    NoFaceInQuery,
    /// Possibly empty set of matching file ids.
    Matches(MatchSet),
}

/// Matches restricted to the files of one listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedMatches<'a> {
    /// Matching files in listing order.
    pub files: Vec<&'a GalleryFile>,
    /// Matched ids that are not part of the listing.
    pub outside: usize,
}

/// Keep the listed files whose id matched. A file listed twice appears once.
pub fn in_listing<'a>(matches: &MatchSet, listing: &'a [GalleryFile]) -> ListedMatches<'a> {
    let mut seen = std::collections::HashSet::new();
    let files: Vec<&GalleryFile> = listing
        .iter()
        .filter(|f| matches.contains(&f.id) && seen.insert(f.id.as_str()))
        .collect();
    ListedMatches {
        outside: matches.len() - files.len(),
        files,
    }
}

/// Pick the query face from a reference photo: the most confident detection.
pub async fn query_face(
    provider: &dyn EmbeddingProvider,
    image: DynamicImage,
) -> Result<Option<DescribedFace>, ProviderError> {
    let faces = provider.describe_all(image).await?;
    Ok(faces
        .into_iter()
        .max_by(|a, b| a.detection.score.total_cmp(&b.detection.score)))
}

pub async fn search(
    provider: &dyn EmbeddingProvider,
    state: &StoreState,
    matcher: &Matcher,
    image: DynamicImage,
) -> Result<SearchOutcome, ProviderError> {
    let Some(store) = state.store() else {
        return Ok(SearchOutcome::StoreNotBuilt);
    };
    let Some(face) = query_face(provider, image).await? else {
        return Ok(SearchOutcome::NoFaceInQuery);
    };

    let matches = matcher.find_matches(store, &face.embedding);
    for record in store.iter().filter(|r| matches.contains(&r.file_id)) {
        if let Some(d) = Matcher::best_distance(record, &face.embedding) {
            debug!("{}: best distance {:.3}", record.file_id, d);
        }
    }
    info!(
        "query face (score {:.2}) matched {} of {} images at threshold {:.2}",
        face.detection.score,
        matches.len(),
        store.len(),
        matcher.threshold()
    );
    Ok(SearchOutcome::Matches(matches))
}
