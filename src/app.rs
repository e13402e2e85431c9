use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use homedir::my_home;

use crate::config::Config;
use crate::semantic::{
    model_id_hash, BpeTokenizer, EmbeddingExtractor, EmbeddingRepository, FileRepository,
    IndexBuilder, RepositoryError, SearchService, VECTORS_FILE,
};

/// Application paths structure
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
    pub vectors_path: PathBuf,
}

impl AppPaths {
    pub fn new(base_path: PathBuf) -> Self {
        let vectors_path = base_path.join(VECTORS_FILE);
        Self {
            base_path,
            vectors_path,
        }
    }
}

/// Builds the application components from configuration
pub struct AppFactory;

impl AppFactory {
    /// Get application paths, creating the base directory
    pub fn get_paths() -> Result<AppPaths> {
        let paths = AppPaths::new(Self::get_base_path()?);

        std::fs::create_dir_all(&paths.base_path)
            .context("Failed to create application base directory")?;

        Ok(paths)
    }

    /// `SNAPSEEK_BASE_PATH`, or `~/.local/share/snapseek`
    fn get_base_path() -> Result<PathBuf> {
        if let Ok(base_path) = std::env::var("SNAPSEEK_BASE_PATH") {
            return Ok(PathBuf::from(base_path));
        }

        let home = my_home()
            .context("Could not determine home directory")?
            .context("Home directory path is empty")?;
        Ok(home.join(".local/share/snapseek"))
    }

    pub fn load_config(paths: &AppPaths) -> Result<Config> {
        Config::load_with(&paths.base_path).context("Failed to load configuration")
    }

    /// Open the embedding store.
    ///
    /// A store written by another model or format version can never be
    /// searched with the current one, so it is replaced by an empty store.
    pub fn open_repository(paths: &AppPaths, config: &Config) -> Result<Arc<FileRepository>> {
        let model_id = model_id_hash(&config.visual_model);
        let path = &paths.vectors_path;

        let repository = match FileRepository::open(path, model_id, config.dimensions) {
            Ok(repository) => repository,
            Err(RepositoryError::ModelMismatch) => {
                log::warn!("Model changed, creating fresh index");
                FileRepository::create(path, model_id, config.dimensions)?
            }
            Err(RepositoryError::VersionMismatch(file_ver, _)) => {
                log::warn!("Storage version {file_ver} unsupported, creating fresh index");
                FileRepository::create(path, model_id, config.dimensions)?
            }
            Err(RepositoryError::DimensionMismatch { expected, got }) => {
                log::warn!("Stored dimensions {got} differ from configured {expected}, creating fresh index");
                FileRepository::create(path, model_id, config.dimensions)?
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open {}", path.display()));
            }
        };

        Ok(Arc::new(repository))
    }

    pub fn load_tokenizer(config: &Config) -> Result<BpeTokenizer> {
        let vocab = config.model_asset(&config.vocab_file);
        let merges = config.model_asset(&config.merges_file);
        BpeTokenizer::from_files(&vocab, &merges, config.unknown_tokens)
            .context("Failed to load tokenizer assets")
    }

    pub fn visual_extractor(config: &Config) -> Result<EmbeddingExtractor> {
        Self::spawn_encoder(config, "visual", &config.visual_model)
    }

    pub fn textual_extractor(config: &Config) -> Result<EmbeddingExtractor> {
        Self::spawn_encoder(config, "textual", &config.textual_model)
    }

    #[cfg(feature = "onnx")]
    fn spawn_encoder(config: &Config, name: &str, file: &str) -> Result<EmbeddingExtractor> {
        use crate::semantic::OnnxEngine;

        let path = config.model_asset(file);
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let engine = OnnxEngine::load(&path, threads)
            .with_context(|| format!("Failed to load {name} encoder"))?;

        EmbeddingExtractor::spawn(name, engine, config.dimensions, config.inference_timeout())
            .with_context(|| format!("Failed to start {name} encoder"))
    }

    #[cfg(not(feature = "onnx"))]
    fn spawn_encoder(_config: &Config, name: &str, _file: &str) -> Result<EmbeddingExtractor> {
        anyhow::bail!("No {name} encoder available: built without the `onnx` feature")
    }

    pub fn index_builder(
        config: &Config,
        repository: Arc<dyn EmbeddingRepository>,
    ) -> Result<IndexBuilder> {
        let extractor = Self::visual_extractor(config)?;
        Ok(IndexBuilder::new(extractor, repository)
            .with_excluded_categories(config.excluded_categories.iter().cloned()))
    }

    /// Search service with a text encoder attached.
    pub fn text_search_service(
        config: &Config,
        repository: Arc<dyn EmbeddingRepository>,
    ) -> Result<SearchService> {
        let tokenizer = Self::load_tokenizer(config)?;
        let extractor = Self::textual_extractor(config)?;
        Ok(SearchService::new(repository).with_text_encoder(tokenizer, extractor))
    }
}
