//! `rag` command-line library.
//!
//! - `cli`: argument parsing with clap
//! - `commands`: command implementations (index, query, stats, rebuild, config)

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands, IndexArgs, ModeArg, QueryArgs};
pub use commands::{
    init_logging, load_settings, rebuild_index, run_index, run_query, show_config, show_stats,
};
