//! On-device semantic photo search.
//!
//! Photos and text queries are embedded into the same CLIP space and compared
//! with cosine similarity.
//!
//! # Architecture
//!
//! - `tokenizer`: CLIP byte-pair encoding of text queries
//! - `preprocess`: Photo bytes to normalized image tensors
//! - `extractor`: Runs an encoder on a worker thread, normalizes the output
//! - `engine`: ONNX Runtime encoder (feature `onnx`)
//! - `storage`: Embedding repositories, including the `vectors.bin` log
//! - `index`: Incremental, cancellable indexing of a photo corpus
//! - `ranker`: Similarity ranking of a repository snapshot
//! - `service`: Text and photo query entry point

#[cfg(feature = "onnx")]
mod engine;
mod extractor;
mod index;
mod preprocess;
mod ranker;
mod service;
mod storage;
mod tokenizer;

#[cfg(feature = "onnx")]
pub use engine::OnnxEngine;
pub use extractor::{
    l2_normalize, EmbeddingExtractor, EngineError, ExtractionError, InferenceEngine, ModelInput,
    DEFAULT_TIMEOUT, IMAGE_SIZE,
};
pub use index::{
    ByteSource, CancelToken, Corpus, IndexBuilder, IndexError, IndexReport, IndexTask,
    PhotoEntry, PhotoError, Progress,
};
pub use preprocess::{image_to_tensor, preprocess_image, PreprocessError};
#[cfg(test)]
pub(crate) use preprocess::encode_png;
pub use ranker::{rank, rank_scored, top_k, RankError, ScoredId};
pub use service::{Query, SearchError, SearchService};
pub use storage::{
    model_id_hash, EmbeddingRecord, EmbeddingRepository, FileRepository, MemoryRepository,
    RepositoryError,
};
pub use tokenizer::{
    clean_text, BpeTokenizer, MergeTable, TokenSequence, TokenizerError, UnknownTokenPolicy,
    Vocabulary, CONTEXT_LENGTH,
};

/// Name of the embedding store inside the base directory
pub const VECTORS_FILE: &str = "vectors.bin";

/// Embedding width of CLIP ViT-B/32
pub const DEFAULT_DIMENSIONS: usize = 512;
