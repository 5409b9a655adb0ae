//! CLI argument parsing for `rag`.
//!
//! Flags given here override every other configuration source.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use rag_types::SearchMode;

/// Contextual retrieval engine
///
/// Indexes text chunks as embeddings and answers similarity queries.
#[derive(Parser, Debug)]
#[command(name = "rag")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/rag-engine/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Index chunks from a JSON-lines file and/or markdown documents
    Index(IndexArgs),

    /// Retrieve the chunks most similar to TEXT
    Query(QueryArgs),

    /// Show index, cache and deferred-queue statistics
    Stats,

    /// Retrain the ANN partitions over the current index
    Rebuild,

    /// Print the effective configuration as TOML
    Config,
}

#[derive(clap::Args, Debug, Clone)]
pub struct IndexArgs {
    /// One chunk per line: source_ref, text, type, optional created_at/title/tags
    #[arg(short, long, required_unless_present = "markdown")]
    pub input: Option<PathBuf>,

    /// Markdown document to split into chunks (repeatable)
    #[arg(long)]
    pub markdown: Vec<PathBuf>,

    /// Chunk type given to markdown chunks
    #[arg(long = "type", default_value = "post")]
    pub chunk_type: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct QueryArgs {
    /// Query text
    pub text: String,

    /// Maximum results (default from config)
    #[arg(short = 'k', long)]
    pub top_k: Option<usize>,

    /// Search mode (default from config)
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Similarity floor (default from config)
    #[arg(long)]
    pub min_similarity: Option<f32>,

    /// Chunk types to leave out (repeatable)
    #[arg(long = "exclude-type")]
    pub exclude_types: Vec<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Ann,
    Exact,
}

impl ModeArg {
    /// ANN parameters come from the configured retrieval settings.
    pub fn to_search_mode(self, nprobe: usize, overfetch: usize) -> SearchMode {
        match self {
            ModeArg::Exact => SearchMode::Exact,
            ModeArg::Ann => SearchMode::Ann { nprobe, overfetch },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_index() {
        let cli = Cli::parse_from(["rag", "index", "--input", "chunks.jsonl"]);
        match cli.command {
            Commands::Index(args) => {
                assert_eq!(args.input, Some(PathBuf::from("chunks.jsonl")));
                assert!(args.markdown.is_empty());
                assert_eq!(args.chunk_type, "post");
            }
            _ => panic!("Expected Index command"),
        }
    }

    #[test]
    fn test_cli_index_markdown() {
        let cli = Cli::parse_from([
            "rag", "index", "--markdown", "a.md", "--markdown", "b.md", "--type", "journal",
        ]);
        match cli.command {
            Commands::Index(args) => {
                assert!(args.input.is_none());
                assert_eq!(args.markdown, vec![PathBuf::from("a.md"), PathBuf::from("b.md")]);
                assert_eq!(args.chunk_type, "journal");
            }
            _ => panic!("Expected Index command"),
        }
    }

    #[test]
    fn test_cli_index_needs_a_source() {
        assert!(Cli::try_parse_from(["rag", "index"]).is_err());
    }

    #[test]
    fn test_cli_query_defaults() {
        let cli = Cli::parse_from(["rag", "query", "what about rust"]);
        match cli.command {
            Commands::Query(args) => {
                assert_eq!(args.text, "what about rust");
                assert!(args.top_k.is_none());
                assert!(args.mode.is_none());
                assert!(args.exclude_types.is_empty());
            }
            _ => panic!("Expected Query command"),
        }
    }

    #[test]
    fn test_cli_query_flags() {
        let cli = Cli::parse_from([
            "rag",
            "query",
            "rust",
            "-k",
            "3",
            "--mode",
            "exact",
            "--min-similarity",
            "0.5",
            "--exclude-type",
            "journal",
            "--exclude-type",
            "profile",
        ]);
        match cli.command {
            Commands::Query(args) => {
                assert_eq!(args.top_k, Some(3));
                assert_eq!(args.mode, Some(ModeArg::Exact));
                assert_eq!(args.min_similarity, Some(0.5));
                assert_eq!(args.exclude_types, vec!["journal", "profile"]);
            }
            _ => panic!("Expected Query command"),
        }
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from(["rag", "stats", "--config", "/tmp/rag.toml", "-l", "debug"]);
        assert_eq!(cli.config, Some("/tmp/rag.toml".to_string()));
        assert_eq!(cli.log_level, Some("debug".to_string()));
        assert!(matches!(cli.command, Commands::Stats));
    }

    #[test]
    fn test_mode_arg_conversion() {
        assert_eq!(ModeArg::Exact.to_search_mode(8, 5), SearchMode::Exact);
        assert_eq!(
            ModeArg::Ann.to_search_mode(8, 5),
            SearchMode::Ann {
                nprobe: 8,
                overfetch: 5
            }
        );
    }
}
