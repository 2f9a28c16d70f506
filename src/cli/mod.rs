// Operator command-line interface. Every command prints JSON on stdout.

pub mod commands;

use crate::search::SearchSort;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "marketplace-scanner")]
#[command(about = "Discover and inspect plugin marketplace repositories", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Search repositories
    Search {
        /// Free-text search query
        query: String,

        /// Minimum star count
        #[arg(long)]
        min_stars: Option<u32>,

        /// Required topic (repeatable)
        #[arg(long = "topic")]
        topics: Vec<String>,

        /// Sort order: best-match, stars, forks or updated
        #[arg(long, default_value = "best-match")]
        sort: SearchSort,

        /// Stop after this many results
        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Fetch and validate a manifest from a repository
    Manifest {
        /// Repository as owner/repo or URL
        repo: String,

        /// Manifest path inside the repository (default: configured candidates)
        #[arg(short, long)]
        path: Option<String>,
    },

    /// Assemble repository metadata
    Metadata {
        /// Repository as owner/repo or URL
        repo: String,

        /// Skip languages, contributors and commits
        #[arg(long)]
        base_only: bool,
    },

    /// Validate a local manifest file
    Validate {
        /// Path to a marketplace.json, plugin.json or YAML equivalent
        file: PathBuf,

        /// Treat content findings as errors
        #[arg(long)]
        strict: bool,
    },

    /// Run one scan cycle
    Scan {
        /// Discovery sweep file
        #[arg(short, long, env = "QUERY_CONFIG_PATH")]
        queries: Option<PathBuf>,

        /// Scan these repositories and skip discovery
        #[arg(long = "repo")]
        repos: Vec<String>,
    },

    /// Show current rate limit budgets
    Limits,
}
