//! Incremental photo indexing.
//!
//! Walks a photo corpus in ascending id order and makes sure every photo has
//! an embedding in the repository:
//! - photos in an excluded category are skipped before any work
//! - photos that already have a record are reused, not re-encoded
//! - everything else is fetched, preprocessed, encoded and upserted
//!
//! A failure on one photo never stops the run. Only repository errors are
//! fatal, since continuing on a broken store would lose data silently.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::semantic::extractor::{EmbeddingExtractor, ExtractionError};
use crate::semantic::preprocess::{preprocess_image, PreprocessError};
use crate::semantic::storage::{EmbeddingRecord, EmbeddingRepository, RepositoryError};

/// Lazily provides the raw bytes of one photo.
pub trait ByteSource: Send {
    fn open(&self) -> std::io::Result<Vec<u8>>;
}

impl<F> ByteSource for F
where
    F: Fn() -> std::io::Result<Vec<u8>> + Send,
{
    fn open(&self) -> std::io::Result<Vec<u8>> {
        self()
    }
}

/// One photo as enumerated by a [`Corpus`].
pub struct PhotoEntry {
    pub id: u64,
    /// Capture (modification) time in unix seconds
    pub captured_at: i64,
    /// Bucket the photo lives in, e.g. "Camera" or "Screenshots"
    pub category: Option<String>,
    pub source: Box<dyn ByteSource>,
}

/// Enumerates the photo library.
pub trait Corpus: Send {
    fn entries(&self) -> std::io::Result<Vec<PhotoEntry>>;
}

/// Why a single photo could not be indexed.
#[derive(Debug, thiserror::Error)]
pub enum PhotoError {
    #[error("could not read photo bytes: {0}")]
    MissingStream(#[source] std::io::Error),

    #[error("could not decode photo: {0}")]
    DecodeFailure(#[source] PreprocessError),

    #[error("inference timed out after {0:?}")]
    InferenceTimeout(Duration),

    #[error("inference failed: {0}")]
    InferenceFailure(#[source] ExtractionError),
}

impl From<ExtractionError> for PhotoError {
    fn from(err: ExtractionError) -> Self {
        match err {
            ExtractionError::Timeout(budget) => PhotoError::InferenceTimeout(budget),
            other => PhotoError::InferenceFailure(other),
        }
    }
}

/// Errors that end an indexing run.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("could not enumerate photos: {0}")]
    Corpus(#[source] std::io::Error),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("indexing task panicked")]
    Panicked,
}

/// Fraction of the corpus handled so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
}

impl Progress {
    /// `processed / total`; an empty corpus counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.processed as f64 / self.total as f64
        }
    }

    pub fn is_complete(&self) -> bool {
        self.processed == self.total
    }
}

/// Summary of one indexing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub total: usize,
    pub indexed: usize,
    pub reused: usize,
    pub excluded: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl IndexReport {
    pub fn processed(&self) -> usize {
        self.indexed + self.reused + self.excluded + self.failed
    }
}

/// Cooperative cancellation flag, checked between photos.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum Outcome {
    Indexed,
    Reused,
    Excluded,
    Failed(PhotoError),
}

pub struct IndexBuilder {
    extractor: EmbeddingExtractor,
    repository: Arc<dyn EmbeddingRepository>,
    excluded_categories: HashSet<String>,
}

impl IndexBuilder {
    pub fn new(extractor: EmbeddingExtractor, repository: Arc<dyn EmbeddingRepository>) -> Self {
        Self {
            extractor,
            repository,
            excluded_categories: HashSet::new(),
        }
    }

    /// Skip photos whose category matches one of `categories` exactly.
    pub fn with_excluded_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn repository(&self) -> &Arc<dyn EmbeddingRepository> {
        &self.repository
    }

    /// Index every photo of `corpus`, publishing progress after each one.
    ///
    /// Returns early, with `cancelled` set, once `cancel` fires. The check
    /// happens between photos, so a photo is either fully stored or untouched.
    pub fn run(
        &self,
        corpus: &dyn Corpus,
        cancel: &CancelToken,
        progress: &watch::Sender<Progress>,
    ) -> Result<IndexReport, IndexError> {
        let mut photos = corpus.entries().map_err(IndexError::Corpus)?;
        photos.sort_by_key(|photo| photo.id);

        let total = photos.len();
        let mut report = IndexReport {
            total,
            ..Default::default()
        };
        progress.send_replace(Progress {
            processed: 0,
            total,
        });
        log::info!("indexing {total} photos");

        for (position, photo) in photos.iter().enumerate() {
            if cancel.is_cancelled() {
                log::info!("indexing cancelled after {position}/{total} photos");
                report.cancelled = true;
                return Ok(report);
            }

            match self.index_photo(photo)? {
                Outcome::Indexed => report.indexed += 1,
                Outcome::Reused => report.reused += 1,
                Outcome::Excluded => report.excluded += 1,
                Outcome::Failed(err) => {
                    log::warn!("skipping photo {}: {err}", photo.id);
                    report.failed += 1;
                }
            }

            progress.send_replace(Progress {
                processed: position + 1,
                total,
            });
        }

        log::info!(
            "indexing done: {} new, {} reused, {} excluded, {} failed",
            report.indexed,
            report.reused,
            report.excluded,
            report.failed
        );
        Ok(report)
    }

    fn index_photo(&self, photo: &PhotoEntry) -> Result<Outcome, IndexError> {
        if let Some(category) = &photo.category {
            if self.excluded_categories.contains(category) {
                log::debug!("photo {} is in excluded category {category:?}", photo.id);
                return Ok(Outcome::Excluded);
            }
        }

        if self.repository.contains(photo.id)? {
            return Ok(Outcome::Reused);
        }

        let vector = match self.embed(photo) {
            Ok(vector) => vector,
            Err(err) => return Ok(Outcome::Failed(err)),
        };

        self.repository.upsert(EmbeddingRecord {
            id: photo.id,
            captured_at: photo.captured_at,
            vector,
        })?;

        Ok(Outcome::Indexed)
    }

    fn embed(&self, photo: &PhotoEntry) -> Result<Vec<f32>, PhotoError> {
        let bytes = photo.source.open().map_err(PhotoError::MissingStream)?;
        let input = preprocess_image(&bytes).map_err(PhotoError::DecodeFailure)?;
        Ok(self.extractor.extract(input)?)
    }
}

/// An indexing run on its own thread.
///
/// Dropping the task cancels it and waits for the current photo to finish.
pub struct IndexTask {
    handle: Option<JoinHandle<Result<IndexReport, IndexError>>>,
    cancel: CancelToken,
    progress: watch::Receiver<Progress>,
}

impl IndexTask {
    pub fn spawn<C>(builder: IndexBuilder, corpus: C) -> std::io::Result<Self>
    where
        C: Corpus + 'static,
    {
        let cancel = CancelToken::new();
        let (progress_tx, progress_rx) = watch::channel(Progress::default());

        let handle = std::thread::Builder::new().name("indexer".to_string()).spawn({
            let cancel = cancel.clone();
            move || builder.run(&corpus, &cancel, &progress_tx)
        })?;

        Ok(Self {
            handle: Some(handle),
            cancel,
            progress: progress_rx,
        })
    }

    /// A fresh subscription to the progress stream.
    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the run to end.
    pub fn join(mut self) -> Result<IndexReport, IndexError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| IndexError::Panicked)?,
            None => Err(IndexError::Panicked),
        }
    }
}

impl Drop for IndexTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.cancel();
            if handle.join().is_err() {
                log::error!("indexing task panicked");
            }
        }
    }
}
