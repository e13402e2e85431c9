use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::semantic::{UnknownTokenPolicy, DEFAULT_DIMENSIONS};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_SEARCH_LIMIT: usize = 50;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the model assets, relative to the base path unless absolute
    #[serde(default = "default_models_dir")]
    pub models_dir: String,

    #[serde(default = "default_visual_model")]
    pub visual_model: String,

    #[serde(default = "default_textual_model")]
    pub textual_model: String,

    #[serde(default = "default_vocab_file")]
    pub vocab_file: String,

    #[serde(default = "default_merges_file")]
    pub merges_file: String,

    /// Embedding width produced by both encoders
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Wall-clock budget of one encoder call
    #[serde(default = "default_inference_timeout_ms")]
    pub inference_timeout_ms: u64,

    /// Photo categories (parent directory names) never indexed
    #[serde(default = "default_excluded_categories")]
    pub excluded_categories: Vec<String>,

    /// File extensions treated as photos
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    #[serde(default)]
    pub unknown_tokens: UnknownTokenPolicy,

    #[serde(default = "default_search_limit")]
    pub search_limit: usize,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            visual_model: default_visual_model(),
            textual_model: default_textual_model(),
            vocab_file: default_vocab_file(),
            merges_file: default_merges_file(),
            dimensions: default_dimensions(),
            inference_timeout_ms: default_inference_timeout_ms(),
            excluded_categories: default_excluded_categories(),
            extensions: default_extensions(),
            unknown_tokens: UnknownTokenPolicy::default(),
            search_limit: default_search_limit(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_models_dir() -> String {
    "models".to_string()
}

fn default_visual_model() -> String {
    "visual.onnx".to_string()
}

fn default_textual_model() -> String {
    "textual.onnx".to_string()
}

fn default_vocab_file() -> String {
    "vocab.json".to_string()
}

fn default_merges_file() -> String {
    "merges.txt".to_string()
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_inference_timeout_ms() -> u64 {
    DEFAULT_INFERENCE_TIMEOUT_MS
}

fn default_excluded_categories() -> Vec<String> {
    vec!["Screenshots".to_string()]
}

fn default_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "webp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_search_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.dimensions == 0 || self.dimensions > u16::MAX as usize {
            bail!("dimensions must be between 1 and {}, got {}", u16::MAX, self.dimensions);
        }
        if self.inference_timeout_ms == 0 {
            bail!("inference_timeout_ms must be greater than 0");
        }
        if self.search_limit == 0 {
            bail!("search_limit must be greater than 0");
        }
        if self.extensions.iter().any(|e| e.is_empty() || e.starts_with('.')) {
            bail!("extensions must be bare names like \"jpg\", got {:?}", self.extensions);
        }
        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults if missing.
    pub fn load_with(base_path: &Path) -> Result<Self> {
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            std::fs::create_dir_all(base_path)
                .with_context(|| format!("failed to create {}", base_path.display()))?;
            std::fs::write(&path, serde_yml::to_string(&Self::default())?)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str)
            .with_context(|| format!("{} is malformed", path.display()))?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.base_path.join(CONFIG_FILE);
        std::fs::write(&path, serde_yml::to_string(&self)?)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn models_path(&self) -> PathBuf {
        self.base_path.join(&self.models_dir)
    }

    pub fn model_asset(&self, file: &str) -> PathBuf {
        self.models_path().join(file)
    }

    pub fn inference_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.inference_timeout_ms)
    }
}
