mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{by_id, files, ids, FakeProvider, FakeSource, RecordingSink};
use facefind::indexer::{pending_files, EmptyFacePolicy, IndexOptions, Indexer, PersistMode};
use facefind::store::EmbeddingStore;
use tokio_util::sync::CancellationToken;

fn options(batch_size: usize) -> IndexOptions {
    IndexOptions {
        batch_size,
        batch_delay: Duration::from_millis(100),
        ..IndexOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn second_run_fetches_nothing() {
    let source = FakeSource::default();
    let provider = FakeProvider::default();
    let sink = RecordingSink::default();
    let indexer = Indexer::new(&source, &provider, options(2));
    let gallery = files(4);
    let mut store = EmbeddingStore::new();

    let first = indexer
        .run(&gallery, &mut store, Some(&sink), &CancellationToken::new())
        .await;
    assert_eq!(first.indexed, 4);
    assert_eq!(first.batches, 2);
    assert_eq!(ids(&store), vec!["f0", "f1", "f2", "f3"]);

    let second = indexer
        .run(&gallery, &mut store, Some(&sink), &CancellationToken::new())
        .await;
    assert_eq!(second.indexed, 0);
    assert_eq!(second.skipped_existing, 4);
    assert_eq!(second.batches, 0);
    assert_eq!(second.saves, 0);
    assert_eq!(store.len(), 4);
    assert_eq!(source.fetched.lock().unwrap().len(), 4);
    assert_eq!(sink.saves(), 1);
}

#[tokio::test(start_paused = true)]
async fn new_gallery_files_are_picked_up() {
    let source = FakeSource::default();
    let provider = FakeProvider::default();
    let indexer = Indexer::new(&source, &provider, options(5));
    let mut store = EmbeddingStore::new();

    indexer
        .run(&files(2), &mut store, None, &CancellationToken::new())
        .await;
    let report = indexer
        .run(&files(5), &mut store, None, &CancellationToken::new())
        .await;

    assert_eq!(report.indexed, 3);
    assert_eq!(report.skipped_existing, 2);
    assert_eq!(ids(&store), vec!["f0", "f1", "f2", "f3", "f4"]);
}

#[tokio::test(start_paused = true)]
async fn faceless_images_are_retried_by_default() {
    let source = FakeSource::default();
    let provider = FakeProvider::faceless(&[1]);
    let indexer = Indexer::new(&source, &provider, options(5));
    let gallery = files(3);
    let mut store = EmbeddingStore::new();

    let first = indexer
        .run(&gallery, &mut store, None, &CancellationToken::new())
        .await;
    assert_eq!(first.indexed, 2);
    assert_eq!(first.no_face, 1);
    assert!(!store.contains("f1"));

    let second = indexer
        .run(&gallery, &mut store, None, &CancellationToken::new())
        .await;
    assert_eq!(second.no_face, 1);
    assert_eq!(second.skipped_existing, 2);
    assert_eq!(source.fetch_count("f1"), 2);
    assert_eq!(source.fetch_count("f0"), 1);
}

#[tokio::test(start_paused = true)]
async fn faceless_images_can_be_recorded() {
    let source = FakeSource::default();
    let provider = FakeProvider::faceless(&[1]);
    let indexer = Indexer::new(
        &source,
        &provider,
        IndexOptions {
            empty_faces: EmptyFacePolicy::Record,
            ..options(5)
        },
    );
    let gallery = files(3);
    let mut store = EmbeddingStore::new();

    let first = indexer
        .run(&gallery, &mut store, None, &CancellationToken::new())
        .await;
    assert_eq!(first.no_face, 1);
    assert_eq!(store.get("f1").map(|r| r.embeddings.len()), Some(0));
    assert_eq!(store.face_count(), 2);

    let second = indexer
        .run(&gallery, &mut store, None, &CancellationToken::new())
        .await;
    assert_eq!(second.skipped_existing, 3);
    assert_eq!(source.fetch_count("f1"), 1);
}

#[tokio::test(start_paused = true)]
async fn every_face_of_an_image_is_kept() {
    let source = FakeSource::default();
    let provider = FakeProvider {
        two_faces: HashSet::from([0]),
        ..FakeProvider::default()
    };
    let indexer = Indexer::new(&source, &provider, options(5));
    let mut store = EmbeddingStore::new();

    indexer
        .run(&files(2), &mut store, None, &CancellationToken::new())
        .await;

    let counts = by_id(&store);
    assert_eq!(counts["f0"], 2);
    assert_eq!(counts["f1"], 1);
}

#[tokio::test(start_paused = true)]
async fn failed_image_does_not_abort_its_batch() {
    let source = FakeSource::failing(&["f1"]);
    let provider = FakeProvider::default();
    let indexer = Indexer::new(&source, &provider, options(3));
    let gallery = files(3);
    let mut store = EmbeddingStore::new();

    let report = indexer
        .run(&gallery, &mut store, None, &CancellationToken::new())
        .await;
    assert_eq!(report.indexed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(ids(&store), vec!["f0", "f2"]);

    // failures are not remembered, so they are retried
    indexer
        .run(&gallery, &mut store, None, &CancellationToken::new())
        .await;
    assert_eq!(source.fetch_count("f1"), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_image_times_out() {
    let source = FakeSource::hanging(&["f0"]);
    let provider = FakeProvider::default();
    let indexer = Indexer::new(
        &source,
        &provider,
        IndexOptions {
            image_timeout: Duration::from_secs(2),
            ..options(2)
        },
    );
    let mut store = EmbeddingStore::new();

    let report = indexer
        .run(&files(2), &mut store, None, &CancellationToken::new())
        .await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.indexed, 1);
    assert_eq!(ids(&store), vec!["f1"]);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_at_batch_boundary_and_resumes() {
    let source = FakeSource::default();
    let provider = FakeProvider::default();
    let sink = RecordingSink::default();
    let indexer = Indexer::new(&source, &provider, options(2));
    let gallery = files(6);
    let mut store = EmbeddingStore::new();

    let cancel = CancellationToken::new();
    let report = indexer
        .run_with_progress(&gallery, &mut store, Some(&sink), &cancel, |progress| {
            if progress.batch == 1 {
                cancel.cancel();
            }
        })
        .await;

    assert!(report.cancelled);
    assert_eq!(report.batches, 1);
    assert_eq!(ids(&store), vec!["f0", "f1"]);
    // partial progress is saved on cancel
    assert_eq!(sink.saves(), 1);
    assert_eq!(sink.snapshots.lock().unwrap()[0], vec!["f0", "f1"]);

    let resumed = indexer
        .run(&gallery, &mut store, Some(&sink), &CancellationToken::new())
        .await;
    assert!(!resumed.cancelled);
    assert_eq!(resumed.indexed, 4);
    assert_eq!(resumed.skipped_existing, 2);
    assert_eq!(ids(&store), vec!["f0", "f1", "f2", "f3", "f4", "f5"]);
    for file in &gallery {
        assert_eq!(source.fetch_count(&file.id), 1, "{} fetched twice", file.id);
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_start_does_nothing() {
    let source = FakeSource::default();
    let provider = FakeProvider::default();
    let sink = RecordingSink::default();
    let indexer = Indexer::new(&source, &provider, options(2));
    let mut store = EmbeddingStore::new();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = indexer
        .run(&files(4), &mut store, Some(&sink), &cancel)
        .await;

    assert!(report.cancelled);
    assert_eq!(report.batches, 0);
    assert!(store.is_empty());
    assert_eq!(sink.saves(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_without_save_on_cancel_skips_save() {
    let source = FakeSource::default();
    let provider = FakeProvider::default();
    let sink = RecordingSink::default();
    let indexer = Indexer::new(
        &source,
        &provider,
        IndexOptions {
            save_on_cancel: false,
            ..options(2)
        },
    );
    let mut store = EmbeddingStore::new();

    let cancel = CancellationToken::new();
    let report = indexer
        .run_with_progress(&files(4), &mut store, Some(&sink), &cancel, |_| cancel.cancel())
        .await;

    assert!(report.cancelled);
    assert_eq!(store.len(), 2);
    assert_eq!(report.saves, 0);
    assert_eq!(sink.saves(), 0);
}

#[tokio::test(start_paused = true)]
async fn every_batch_persistence_saves_growing_snapshots() {
    let source = FakeSource::default();
    let provider = FakeProvider::default();
    let sink = RecordingSink::default();
    let indexer = Indexer::new(
        &source,
        &provider,
        IndexOptions {
            persist: PersistMode::EveryBatch,
            ..options(2)
        },
    );
    let mut store = EmbeddingStore::new();

    let report = indexer
        .run(&files(6), &mut store, Some(&sink), &CancellationToken::new())
        .await;

    assert_eq!(report.saves, 3);
    let sizes: Vec<usize> = sink.snapshots.lock().unwrap().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 4, 6]);
}

#[tokio::test(start_paused = true)]
async fn batch_without_new_records_is_not_saved() {
    let source = FakeSource::failing(&["f2", "f3"]);
    let provider = FakeProvider::default();
    let sink = RecordingSink::default();
    let indexer = Indexer::new(
        &source,
        &provider,
        IndexOptions {
            persist: PersistMode::EveryBatch,
            ..options(2)
        },
    );
    let mut store = EmbeddingStore::new();

    let report = indexer
        .run(&files(4), &mut store, Some(&sink), &CancellationToken::new())
        .await;

    assert_eq!(report.batches, 2);
    assert_eq!(report.saves, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_save_is_reported() {
    let source = FakeSource::default();
    let provider = FakeProvider::default();
    let sink = RecordingSink {
        fail: true,
        ..RecordingSink::default()
    };
    let indexer = Indexer::new(&source, &provider, options(2));
    let mut store = EmbeddingStore::new();

    let report = indexer
        .run(&files(3), &mut store, Some(&sink), &CancellationToken::new())
        .await;

    assert_eq!(report.indexed, 3);
    assert_eq!(report.saves, 0);
    assert_eq!(report.save_failures, 1);
    // the in-memory store keeps the work
    assert_eq!(store.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn duplicate_listing_entries_are_indexed_once() {
    let source = FakeSource::default();
    let provider = FakeProvider::default();
    let indexer = Indexer::new(&source, &provider, options(5));
    let mut gallery = files(2);
    gallery.push(gallery[0].clone());
    let mut store = EmbeddingStore::new();

    let report = indexer
        .run(&gallery, &mut store, None, &CancellationToken::new())
        .await;

    assert_eq!(report.indexed, 2);
    assert_eq!(report.skipped_existing, 1);
    assert_eq!(source.fetch_count("f0"), 1);
    assert_eq!(store.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn batches_run_concurrently_but_bounded() {
    let source = FakeSource::default();
    let provider = FakeProvider::default();
    let indexer = Indexer::new(&source, &provider, options(3));
    let mut store = EmbeddingStore::new();

    let mut progress = Vec::new();
    let report = indexer
        .run_with_progress(
            &files(7),
            &mut store,
            None,
            &CancellationToken::new(),
            |p| progress.push(*p),
        )
        .await;

    assert_eq!(report.batches, 3);
    assert_eq!(source.peak_active.load(Ordering::SeqCst), 3);
    assert_eq!(
        progress.iter().map(|p| p.processed).collect::<Vec<_>>(),
        vec![3, 6, 7]
    );
    let last = progress.last().unwrap();
    assert_eq!(last.total_batches, 3);
    assert_eq!(last.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn indexed_embeddings_come_from_the_provider() {
    let source = FakeSource::default();
    let provider = FakeProvider::default();
    let indexer = Indexer::new(&source, &provider, options(5));
    let mut store = EmbeddingStore::new();

    indexer
        .run(&files(3), &mut store, None, &CancellationToken::new())
        .await;

    let record = store.get("f2").unwrap();
    assert_eq!(record.embeddings[0].vector.to_vec(), vec![2.0, 0.0]);
}

#[test]
fn pending_files_skips_indexed_and_repeated_ids() {
    let mut gallery = files(4);
    gallery.push(gallery[3].clone());
    let mut store = EmbeddingStore::new();
    store.insert(facefind::store::EmbeddingRecord::new("f1", vec![]));

    let pending: Vec<&str> = pending_files(&gallery, &store)
        .iter()
        .map(|f| f.id.as_str())
        .collect();
    assert_eq!(pending, vec!["f0", "f2", "f3"]);
}

#[test]
fn fully_indexed_gallery_has_nothing_pending() {
    let gallery = files(2);
    let mut store = EmbeddingStore::new();
    for file in &gallery {
        store.insert(facefind::store::EmbeddingRecord::new(file.id.clone(), vec![]));
    }
    assert!(pending_files(&gallery, &store).is_empty());
}
