//! Configuration loading for the retrieval engine.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at ~/.config/rag-engine/config.toml.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chunk::ChunkType;
use crate::error::RagError;

/// `top_k` values above this work but usually dilute the context.
const TOP_K_WARNING_THRESHOLD: usize = 10;

/// Largest batch the supported providers accept.
const MAX_PROVIDER_BATCH: usize = 100;

/// Retrieval mode as written in config files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalModeKind {
    #[default]
    Ann,
    Exact,
}

/// Similarity metric used by the vector index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    Dot,
    /// Negative euclidean distance, so larger is still more similar
    Euclidean,
}

/// Embedding provider backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Google Generative Language `batchEmbedContents`
    #[default]
    Gemini,
    /// OpenAI-compatible `/embeddings`
    Openai,
    /// Deterministic offline provider
    Mock,
}

/// Query-path settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Results below this similarity are dropped (0.0-1.0).
    #[serde(default = "default_min_similarity")]
    pub min_similarity_threshold: f32,

    #[serde(default)]
    pub mode: RetrievalModeKind,

    /// Partitions probed in ANN mode.
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,

    /// ANN candidate multiplier before exact re-scoring.
    #[serde(default = "default_overfetch")]
    pub overfetch: usize,

    /// Chunks newer than this many days are never returned.
    #[serde(default)]
    pub exclude_recent_days: u32,

    /// Keep only the best chunk per source artifact.
    #[serde(default = "default_true")]
    pub deduplicate: bool,

    /// Deadline for the whole query path.
    #[serde(default = "default_query_deadline_ms")]
    pub query_deadline_ms: u64,
}

fn default_top_k() -> usize {
    5
}

fn default_min_similarity() -> f32 {
    0.7
}

fn default_nprobe() -> usize {
    8
}

fn default_overfetch() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_query_deadline_ms() -> u64 {
    10_000
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity_threshold: default_min_similarity(),
            mode: RetrievalModeKind::default(),
            nprobe: default_nprobe(),
            overfetch: default_overfetch(),
            exclude_recent_days: 0,
            deduplicate: true,
            query_deadline_ms: default_query_deadline_ms(),
        }
    }
}

impl RetrievalSettings {
    pub fn query_deadline(&self) -> Duration {
        Duration::from_millis(self.query_deadline_ms)
    }
}

/// Indexing-path settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingSettings {
    /// Chunk types eligible for indexing.
    #[serde(default = "default_indexable_types")]
    pub indexable_types: Vec<String>,

    /// Deferred chunks older than this are dropped.
    #[serde(default = "default_max_deferred_age_secs")]
    pub max_deferred_age_secs: u64,

    /// Token budget per chunk when splitting markdown documents.
    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: usize,

    /// Tokens of trailing paragraphs repeated at the start of the next chunk.
    #[serde(default = "default_chunk_overlap_tokens")]
    pub chunk_overlap_tokens: usize,
}

fn default_indexable_types() -> Vec<String> {
    vec!["post".to_string()]
}

fn default_max_deferred_age_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_max_chunk_tokens() -> usize {
    1800
}

fn default_chunk_overlap_tokens() -> usize {
    150
}

impl Default for IndexingSettings {
    fn default() -> Self {
        Self {
            indexable_types: default_indexable_types(),
            max_deferred_age_secs: default_max_deferred_age_secs(),
            max_chunk_tokens: default_max_chunk_tokens(),
            chunk_overlap_tokens: default_chunk_overlap_tokens(),
        }
    }
}

impl IndexingSettings {
    pub fn allowed_types(&self) -> Vec<ChunkType> {
        self.indexable_types.iter().map(ChunkType::new).collect()
    }

    pub fn max_deferred_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_deferred_age_secs.min(i64::MAX as u64) as i64)
    }
}

/// Embedding provider and cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default)]
    pub provider: ProviderKind,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Fixed vector dimension; mismatches are hard errors.
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// API base URL (provider default when unset)
    #[serde(default)]
    pub base_url: Option<String>,

    /// API key (usually supplied through RAG_EMBEDDING__API_KEY)
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Consecutive failures before a call gives up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// In-memory cache entries.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
}

fn default_embedding_model() -> String {
    "models/gemini-embedding-001".to_string()
}

fn default_dimension() -> usize {
    768
}

fn default_max_batch_size() -> usize {
    MAX_PROVIDER_BATCH
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    5
}

fn default_cache_capacity() -> usize {
    10_000
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            model: default_embedding_model(),
            dimension: default_dimension(),
            base_url: None,
            api_key: None,
            max_batch_size: default_max_batch_size(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: None,
        }
    }
}

impl EmbeddingSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }

    /// Cache namespace: entries written under another model never match.
    pub fn model_version(&self) -> String {
        format!("{}@{}", self.model, self.dimension)
    }
}

/// Dual-queue router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Interactive requests queued before the oldest is shed.
    #[serde(default = "default_interactive_queue_depth")]
    pub interactive_queue_depth: usize,

    /// Starved ticks before background work gets a guaranteed slot.
    #[serde(default = "default_starvation_ticks")]
    pub starvation_ticks: u32,
}

fn default_interactive_queue_depth() -> usize {
    64
}

fn default_starvation_ticks() -> u32 {
    8
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            interactive_queue_depth: default_interactive_queue_depth(),
            starvation_ticks: default_starvation_ticks(),
        }
    }
}

/// Quota governor settings shared by every provider consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSettings {
    #[serde(default = "default_per_second_limit")]
    pub per_second_limit: u32,

    /// Simultaneous in-flight provider calls.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Provider calls per UTC day.
    #[serde(default = "default_daily_request_budget")]
    pub daily_request_budget: u64,
}

fn default_per_second_limit() -> u32 {
    5
}

fn default_concurrency() -> usize {
    4
}

fn default_daily_request_budget() -> u64 {
    1_500
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            per_second_limit: default_per_second_limit(),
            concurrency: default_concurrency(),
            daily_request_budget: default_daily_request_budget(),
        }
    }
}

/// Vector index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSettings {
    #[serde(default)]
    pub metric: SimilarityMetric,

    /// Number of IVF partitions.
    #[serde(default = "default_nlist")]
    pub nlist: usize,

    /// Records required before partitions are trained.
    #[serde(default = "default_min_train_size")]
    pub min_train_size: usize,

    /// Partitions retrain once the index grows by this factor.
    #[serde(default = "default_retrain_growth")]
    pub retrain_growth: f32,
}

fn default_nlist() -> usize {
    64
}

fn default_min_train_size() -> usize {
    256
}

fn default_retrain_growth() -> f32 {
    2.0
}

impl Default for VectorSettings {
    fn default() -> Self {
        Self {
            metric: SimilarityMetric::default(),
            nlist: default_nlist(),
            min_train_size: default_min_train_size(),
            retrain_growth: default_retrain_growth(),
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root directory for cache, index and deferred state
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub retrieval: RetrievalSettings,

    #[serde(default)]
    pub indexing: IndexingSettings,

    #[serde(default)]
    pub embedding: EmbeddingSettings,

    #[serde(default)]
    pub router: RouterSettings,

    #[serde(default)]
    pub quota: QuotaSettings,

    #[serde(default)]
    pub vector: VectorSettings,
}

fn default_data_dir() -> String {
    ProjectDirs::from("", "", "rag-engine")
        .map(|p| p.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./rag-data"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            retrieval: RetrievalSettings::default(),
            indexing: IndexingSettings::default(),
            embedding: EmbeddingSettings::default(),
            router: RouterSettings::default(),
            quota: QuotaSettings::default(),
            vector: VectorSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/rag-engine/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (RAG_*, nested keys joined with `__`)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, RagError> {
        let config_dir = ProjectDirs::from("", "", "rag-engine")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let default_config_path = config_dir.join("config");

        let defaults =
            Config::try_from(&Settings::default()).map_err(|e| RagError::Config(e.to_string()))?;

        let mut builder = Config::builder()
            .add_source(defaults)
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Format: RAG_DATA_DIR, RAG_RETRIEVAL__TOP_K, RAG_QUOTA__PER_SECOND_LIMIT, etc.
        builder = builder.add_source(
            Environment::with_prefix("RAG")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("indexing.indexable_types")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| RagError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| RagError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), RagError> {
        let r = &self.retrieval;
        if r.top_k == 0 {
            return Err(RagError::Config("retrieval.top_k must be > 0".to_string()));
        }
        if r.top_k > TOP_K_WARNING_THRESHOLD {
            warn!(
                top_k = r.top_k,
                "retrieval.top_k is unusually high; 5-10 usually gives better context"
            );
        }
        if !(0.0..=1.0).contains(&r.min_similarity_threshold) {
            return Err(RagError::Config(format!(
                "retrieval.min_similarity_threshold must be 0.0-1.0, got {}",
                r.min_similarity_threshold
            )));
        }
        if r.nprobe == 0 || r.overfetch == 0 {
            return Err(RagError::Config(
                "retrieval.nprobe and retrieval.overfetch must be > 0".to_string(),
            ));
        }
        if r.query_deadline_ms == 0 {
            return Err(RagError::Config(
                "retrieval.query_deadline_ms must be > 0".to_string(),
            ));
        }

        let e = &self.embedding;
        if e.dimension == 0 {
            return Err(RagError::Config("embedding.dimension must be > 0".to_string()));
        }
        if e.max_batch_size == 0 || e.max_batch_size > MAX_PROVIDER_BATCH {
            return Err(RagError::Config(format!(
                "embedding.max_batch_size must be 1-{MAX_PROVIDER_BATCH}, got {}",
                e.max_batch_size
            )));
        }
        if e.timeout_secs == 0 {
            return Err(RagError::Config("embedding.timeout_secs must be > 0".to_string()));
        }
        if e.max_retries == 0 {
            return Err(RagError::Config("embedding.max_retries must be > 0".to_string()));
        }
        if e.cache_capacity == 0 {
            return Err(RagError::Config(
                "embedding.cache_capacity must be > 0".to_string(),
            ));
        }

        if self.router.interactive_queue_depth == 0 {
            return Err(RagError::Config(
                "router.interactive_queue_depth must be > 0".to_string(),
            ));
        }

        let q = &self.quota;
        if q.per_second_limit == 0 || q.concurrency == 0 || q.daily_request_budget == 0 {
            return Err(RagError::Config(
                "quota limits must all be > 0".to_string(),
            ));
        }

        if self.vector.nlist == 0 {
            return Err(RagError::Config("vector.nlist must be > 0".to_string()));
        }
        if self.vector.retrain_growth <= 1.0 {
            return Err(RagError::Config(
                "vector.retrain_growth must be > 1.0".to_string(),
            ));
        }

        if self.indexing.indexable_types.is_empty() {
            return Err(RagError::Config(
                "indexing.indexable_types must not be empty".to_string(),
            ));
        }
        if self.indexing.max_chunk_tokens == 0
            || self.indexing.chunk_overlap_tokens >= self.indexing.max_chunk_tokens
        {
            return Err(RagError::Config(
                "indexing.chunk_overlap_tokens must be below a positive max_chunk_tokens"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Expand ~ in data_dir to the user's home directory
    pub fn expanded_data_dir(&self) -> PathBuf {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Some(dirs) = BaseDirs::new() {
                return dirs.home_dir().join(rest);
            }
        }
        PathBuf::from(&self.data_dir)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.expanded_data_dir().join("embedding-cache")
    }

    pub fn index_path(&self) -> PathBuf {
        self.expanded_data_dir().join("vector-index")
    }

    pub fn deferred_path(&self) -> PathBuf {
        self.expanded_data_dir().join("deferred.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.retrieval.top_k, 5);
        assert_eq!(settings.retrieval.mode, RetrievalModeKind::Ann);
        assert_eq!(settings.embedding.dimension, 768);
        assert_eq!(settings.embedding.max_batch_size, 100);
        assert_eq!(settings.indexing.indexable_types, vec!["post".to_string()]);
        assert_eq!(settings.indexing.max_chunk_tokens, 1800);
        assert_eq!(settings.indexing.chunk_overlap_tokens, 150);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_overlap_past_budget() {
        let mut settings = Settings::default();
        settings.indexing.chunk_overlap_tokens = settings.indexing.max_chunk_tokens;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_with_file_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[retrieval]
top_k = 3
mode = "exact"

[quota]
per_second_limit = 2
"#
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.retrieval.top_k, 3);
        assert_eq!(settings.retrieval.mode, RetrievalModeKind::Exact);
        assert_eq!(settings.quota.per_second_limit, 2);
        // Untouched sections keep defaults
        assert_eq!(settings.quota.concurrency, 4);
        assert_eq!(settings.embedding.max_retries, 5);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut settings = Settings::default();
        settings.retrieval.min_similarity_threshold = 1.5;
        assert!(matches!(settings.validate(), Err(RagError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_oversized_batch() {
        let mut settings = Settings::default();
        settings.embedding.max_batch_size = 101;
        assert!(settings.validate().is_err());

        settings.embedding.max_batch_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_quota() {
        let mut settings = Settings::default();
        settings.quota.per_second_limit = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_model_version_includes_dimension() {
        let settings = EmbeddingSettings::default();
        assert_eq!(settings.model_version(), "models/gemini-embedding-001@768");
    }

    #[test]
    fn test_allowed_types_normalized() {
        let settings = IndexingSettings {
            indexable_types: vec!["POST".to_string(), "Journal".to_string()],
            ..Default::default()
        };
        assert_eq!(
            settings.allowed_types(),
            vec![ChunkType::new("post"), ChunkType::new("journal")]
        );
    }

    #[test]
    fn test_derived_paths() {
        let settings = Settings {
            data_dir: "/tmp/rag".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.cache_path(), PathBuf::from("/tmp/rag/embedding-cache"));
        assert_eq!(settings.index_path(), PathBuf::from("/tmp/rag/vector-index"));
        assert_eq!(settings.deferred_path(), PathBuf::from("/tmp/rag/deferred.json"));
    }
}
