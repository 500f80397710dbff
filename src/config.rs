use crate::facets::{FacetNames, DEFAULT_FACETS};
use crate::pipeline::PipelineOptions;
use crate::search::SearchOptions;
use crate::watch::WatchSettings;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration loaded from settings.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub ollama: OllamaConfig,
    /// "ollama" or "tei"
    pub embedding_provider: String,
    pub tei: TeiConfig,
    pub facets: FacetsConfig,
    pub watch: WatchConfig,
    pub pipeline: PipelineConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub url: String,
    /// Multimodal model that describes images
    pub vision_model: String,
    /// Text model that expands descriptions into facet captions
    pub caption_model: String,
    pub embed_model: String,
    /// Embedding size; derived from the model name when absent
    pub dims: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeiConfig {
    pub url: String,
    pub dims: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FacetsConfig {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub directories: Vec<String>,
    pub debounce_ms: u64,
    pub max_retry_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub desktop_notifications: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub model_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub top_k: usize,
    pub fetch_multiplier: usize,
    pub skip_missing_files: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/imgfacet/index".to_string(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:11434".to_string(),
            vision_model: "gemma3:4b".to_string(),
            caption_model: "qwen3:8b".to_string(),
            embed_model: "qwen3-embedding:4b".to_string(),
            dims: None,
        }
    }
}

impl Default for TeiConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            dims: 1024,
        }
    }
}

impl Default for FacetsConfig {
    fn default() -> Self {
        Self {
            names: DEFAULT_FACETS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            debounce_ms: 1500,
            max_retry_attempts: 5,
            backoff_base_ms: 2000,
            backoff_max_ms: 60_000,
            desktop_notifications: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            model_timeout_secs: 120,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            fetch_multiplier: 3,
            skip_missing_files: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            ollama: OllamaConfig::default(),
            embedding_provider: "ollama".to_string(),
            tei: TeiConfig::default(),
            facets: FacetsConfig::default(),
            watch: WatchConfig::default(),
            pipeline: PipelineConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default location or return defaults
    pub fn load() -> Result<Self> {
        let default_paths = [
            "config/settings.toml",
            "./config/settings.toml",
            "~/.config/imgfacet/settings.toml",
        ];

        for path in default_paths {
            let path = expand_path(path);
            if path.exists() {
                tracing::debug!(path = %path.display(), "loading configuration");
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    /// Reject settings the indexer cannot run with
    pub fn validate(&self) -> Result<()> {
        self.facet_names()?;
        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be at least 1");
        }
        if self.search.top_k == 0 {
            bail!("search.top_k must be at least 1");
        }
        if self.search.fetch_multiplier == 0 {
            bail!("search.fetch_multiplier must be at least 1");
        }
        if self.watch.max_retry_attempts == 0 {
            bail!("watch.max_retry_attempts must be at least 1");
        }
        if self.pipeline.model_timeout_secs == 0 {
            bail!("pipeline.model_timeout_secs must be at least 1");
        }
        if self.watch.backoff_base_ms > self.watch.backoff_max_ms {
            bail!(
                "watch.backoff_base_ms ({}) must not exceed watch.backoff_max_ms ({})",
                self.watch.backoff_base_ms,
                self.watch.backoff_max_ms
            );
        }
        match self.embedding_provider.as_str() {
            "ollama" | "tei" => Ok(()),
            other => bail!("unknown embedding_provider '{}', expected \"ollama\" or \"tei\"", other),
        }
    }

    pub fn facet_names(&self) -> Result<FacetNames> {
        FacetNames::new(self.facets.names.as_slice())
            .map_err(|e| anyhow::anyhow!("invalid facets.names: {}", e))
    }

    pub fn store_path(&self) -> PathBuf {
        expand_path(&self.store.path)
    }

    pub fn watch_directories(&self) -> Vec<PathBuf> {
        self.watch.directories.iter().map(|d| expand_path(d)).collect()
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.model_timeout_secs)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            model_timeout: self.model_timeout(),
            workers: self.pipeline.workers,
        }
    }

    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            fetch_multiplier: self.search.fetch_multiplier,
            skip_missing_files: self.search.skip_missing_files,
            model_timeout: self.model_timeout(),
        }
    }

    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            debounce: Duration::from_millis(self.watch.debounce_ms),
            max_attempts: self.watch.max_retry_attempts,
            backoff_base: Duration::from_millis(self.watch.backoff_base_ms),
            backoff_max: Duration::from_millis(self.watch.backoff_max_ms),
        }
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.ollama.url, "http://127.0.0.1:11434");
        assert_eq!(config.ollama.vision_model, "gemma3:4b");
        assert_eq!(config.embedding_provider, "ollama");
        assert_eq!(config.facets.names.len(), 7);
        assert_eq!(config.watch.debounce_ms, 1500);
        assert_eq!(config.search.top_k, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("settings.toml");
        std::fs::write(
            &file,
            r#"
embedding_provider = "tei"

[store]
path = "/var/lib/imgfacet"

[ollama]
url = "http://gpu-box:11434"
vision_model = "llava:13b"

[tei]
url = "http://localhost:8081"
dims = 768

[facets]
names = ["concept", "layout", "phrase"]

[watch]
directories = ["/photos"]
debounce_ms = 500

[search]
top_k = 5
"#,
        )
        .unwrap();

        let config = Config::from_file(&file).unwrap();
        assert_eq!(config.store_path(), PathBuf::from("/var/lib/imgfacet"));
        assert_eq!(config.ollama.vision_model, "llava:13b");
        // Unset keys keep their defaults
        assert_eq!(config.ollama.caption_model, "qwen3:8b");
        assert_eq!(config.tei.dims, 768);
        assert_eq!(config.facet_names().unwrap().len(), 3);
        assert_eq!(config.watch_directories(), vec![PathBuf::from("/photos")]);
        assert_eq!(config.watch_settings().debounce, Duration::from_millis(500));
        assert_eq!(config.watch_settings().max_attempts, 5);
        assert_eq!(config.search.top_k, 5);
        assert_eq!(config.pipeline_options().workers, 4);
    }

    #[test]
    fn test_tilde_is_expanded() {
        let config = Config::default();
        assert!(!config.store_path().to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.pipeline.workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.facets.names = vec!["concept".into(), "concept".into()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.facets.names.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.embedding_provider = "openai".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.watch.max_retry_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.model_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.watch.backoff_base_ms = 90_000;
        config.watch.backoff_max_ms = 60_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backoff_base_ms"));
    }

    #[test]
    fn test_unreadable_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(Config::from_file(dir.path().join("missing.toml")).is_err());

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[pipeline]\nworkers = \"many\"").unwrap();
        assert!(Config::from_file(&bad).is_err());
    }
}
