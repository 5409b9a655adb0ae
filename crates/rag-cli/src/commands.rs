//! Command implementations for `rag`.
//!
//! Each command loads what it needs from `data_dir`: `index` and `query`
//! build the full embedding stack, `stats` and `rebuild` only open the
//! on-disk stores.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rag_embeddings::{build_provider, CacheStats, CachedEmbedder, EmbeddingCache};
use rag_retrieval::{DeferredQueue, MarkdownChunker, PipelineConfig, RetrievalPipeline};
use rag_router::{EmbeddingRouter, RouterConfig, RoutedEmbedder};
use rag_types::{Chunk, Query, Settings};
use rag_vector::{IndexConfig, IndexStats, VectorIndex};

use crate::cli::{IndexArgs, QueryArgs};

type Pipeline = RetrievalPipeline<CachedEmbedder<RoutedEmbedder>>;

/// Load settings and apply CLI overrides.
pub fn load_settings(config_path: Option<&str>, log_level: Option<&str>) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    if let Some(level) = log_level {
        settings.log_level = level.to_string();
    }
    Ok(settings)
}

/// Install the tracing subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(settings: &Settings) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// One line of an `index --input` file.
#[derive(Debug, Deserialize)]
struct ChunkInput {
    source_ref: String,
    text: String,
    #[serde(rename = "type")]
    chunk_type: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

impl ChunkInput {
    fn into_chunk(self, now: DateTime<Utc>) -> Chunk {
        let mut chunk = Chunk::new(
            self.source_ref,
            self.text,
            self.chunk_type,
            self.created_at.unwrap_or(now),
        )
        .with_tags(self.tags);
        chunk.title = self.title;
        chunk
    }
}

/// Parse chunks from JSON lines. Blank lines are ignored.
fn read_chunks(reader: impl BufRead) -> Result<Vec<Chunk>> {
    let now = Utc::now();
    let mut chunks = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        let input: ChunkInput = serde_json::from_str(&line)
            .with_context(|| format!("Invalid chunk on line {}", number + 1))?;
        chunks.push(input.into_chunk(now));
    }
    Ok(chunks)
}

/// First level-one heading of a markdown document.
fn markdown_title(content: &str) -> Option<&str> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(str::trim)
        .filter(|title| !title.is_empty())
}

/// Split a markdown file into chunks. The file's modification time is the
/// chunks' creation time.
fn read_markdown(chunker: &MarkdownChunker, path: &Path, chunk_type: &str) -> Result<Vec<Chunk>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let created_at = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let source_ref = path.display().to_string();
    Ok(chunker.chunk_document(
        &source_ref,
        &content,
        chunk_type,
        created_at,
        markdown_title(&content),
    ))
}

fn open_index(settings: &Settings) -> Result<Arc<VectorIndex>> {
    let path = settings.index_path();
    std::fs::create_dir_all(&path).context("Failed to create index directory")?;
    let index = VectorIndex::open(&path, IndexConfig::from_settings(settings))
        .with_context(|| format!("Failed to open vector index at {}", path.display()))?;
    Ok(Arc::new(index))
}

fn open_cache(settings: &Settings) -> Result<EmbeddingCache> {
    let path = settings.cache_path();
    std::fs::create_dir_all(&path).context("Failed to create cache directory")?;
    EmbeddingCache::open(
        &path,
        settings.embedding.cache_capacity,
        settings.embedding.cache_ttl(),
    )
    .with_context(|| format!("Failed to open embedding cache at {}", path.display()))
}

/// Build the full query/indexing stack. Must run inside the tokio runtime.
fn build_pipeline(settings: &Settings) -> Result<Pipeline> {
    let provider = build_provider(&settings.embedding).context("Failed to create embedding provider")?;
    info!(
        model = provider.model_version(),
        dimension = provider.dimension(),
        "Embedding provider ready"
    );

    let router = EmbeddingRouter::spawn(provider, RouterConfig::from_settings(settings));
    let embedder = CachedEmbedder::new(
        RoutedEmbedder::new(router, settings.embedding.max_retries),
        Arc::new(open_cache(settings)?),
    );

    let deferred = DeferredQueue::load(settings.deferred_path()).context("Failed to load deferred queue")?;
    Ok(RetrievalPipeline::new(
        embedder,
        open_index(settings)?,
        PipelineConfig::from_settings(settings),
    )
    .with_deferred(deferred))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Index chunks from a JSON-lines file and markdown documents, then
/// persist the deferred queue.
pub async fn run_index(settings: &Settings, args: IndexArgs) -> Result<()> {
    let mut chunks = Vec::new();
    if let Some(input) = &args.input {
        let file = File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
        let read = read_chunks(BufReader::new(file))?;
        info!(chunks = read.len(), input = %input.display(), "Read chunks");
        chunks.extend(read);
    }
    if !args.markdown.is_empty() {
        let chunker = MarkdownChunker::from_settings(settings);
        for path in &args.markdown {
            let read = read_markdown(&chunker, path, &args.chunk_type)?;
            info!(chunks = read.len(), document = %path.display(), "Chunked markdown");
            chunks.extend(read);
        }
    }

    let pipeline = build_pipeline(settings)?;
    let report = pipeline.index(chunks).await.context("Indexing failed")?;

    let deferred = pipeline.deferred_snapshot();
    deferred
        .save(settings.deferred_path())
        .context("Failed to save deferred queue")?;
    if !deferred.is_empty() {
        warn!(deferred = deferred.len(), "Chunks left for the next indexing run");
    }

    print_json(&report)
}

/// Build a query from config defaults and CLI overrides.
fn build_query(settings: &Settings, args: QueryArgs) -> Query {
    let retrieval = &settings.retrieval;
    let mut query = Query::from_settings(args.text, retrieval);
    if let Some(top_k) = args.top_k {
        query = query.with_top_k(top_k);
    }
    if let Some(mode) = args.mode {
        query = query.with_mode(mode.to_search_mode(retrieval.nprobe, retrieval.overfetch));
    }
    if let Some(min_similarity) = args.min_similarity {
        query = query.with_min_similarity(min_similarity);
    }
    for chunk_type in args.exclude_types {
        query = query.excluding_type(chunk_type);
    }
    query
}

pub async fn run_query(settings: &Settings, args: QueryArgs) -> Result<()> {
    let query = build_query(settings, args);
    let pipeline = build_pipeline(settings)?;
    let outcome = pipeline.retrieve(&query).await;
    if let Some(reason) = outcome.degraded {
        warn!(reason = reason.as_str(), "Query returned degraded results");
    }
    print_json(&outcome)
}

#[derive(Debug, Serialize)]
struct StatsReport {
    index: IndexStats,
    cache: CacheStats,
    deferred_chunks: usize,
}

pub fn show_stats(settings: &Settings) -> Result<()> {
    let index = open_index(settings)?;
    let cache = open_cache(settings)?;
    let deferred = DeferredQueue::load(settings.deferred_path()).context("Failed to load deferred queue")?;
    print_json(&StatsReport {
        index: index.stats()?,
        cache: cache.stats(),
        deferred_chunks: deferred.len(),
    })
}

pub fn rebuild_index(settings: &Settings) -> Result<()> {
    let index = open_index(settings)?;
    let stats = index.rebuild().context("Failed to rebuild index")?;
    print_json(&stats)
}

/// Settings with secrets masked, for display.
fn redacted(settings: &Settings) -> Settings {
    let mut shown = settings.clone();
    if shown.embedding.api_key.is_some() {
        shown.embedding.api_key = Some("********".to_string());
    }
    shown
}

pub fn show_config(settings: &Settings) -> Result<()> {
    let text = toml::to_string_pretty(&redacted(settings)).context("Failed to render configuration")?;
    print!("{text}");
    Ok(())
}
