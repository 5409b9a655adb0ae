//! Contextual retrieval engine CLI
//!
//! # Usage
//!
//! ```bash
//! rag index --input chunks.jsonl
//! rag index --markdown posts/2024-05-01.md --type post
//! rag query "what did we write about caching?" --top-k 3
//! rag stats
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/rag-engine/config.toml)
//! 3. `--config` file
//! 4. Environment variables (RAG_*)
//! 5. CLI flags

use anyhow::Result;
use clap::Parser;

use rag_cli::{
    init_logging, load_settings, rebuild_index, run_index, run_query, show_config, show_stats,
    Cli, Commands,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref(), cli.log_level.as_deref())?;
    init_logging(&settings)?;

    match cli.command {
        Commands::Index(args) => {
            run_index(&settings, args).await?;
        }
        Commands::Query(args) => {
            run_query(&settings, args).await?;
        }
        Commands::Stats => {
            show_stats(&settings)?;
        }
        Commands::Rebuild => {
            rebuild_index(&settings)?;
        }
        Commands::Config => {
            show_config(&settings)?;
        }
    }

    Ok(())
}
