//! aptmirror
//!
//! Mirrors APT repositories into an S3 bucket.
//!
//! # Overview
//!
//! - **Index parsing**: `Release` manifests, package and source lists and
//!   translation indices become work items ([`index`])
//! - **Content sync**: a worker pool verifies or uploads every artifact
//!   ([`content`])
//! - **Metadata publish**: index files go live per distribution through
//!   backup, stage, flip and rollback ([`publish`])
//! - **Purge**: dated backups past their retention are deleted ([`delete`])
//!
//! Every worker shares one [`ErrorSignal`]; the first unrecoverable failure
//! stops the run and no further metadata is published.

pub mod config;
pub mod content;
pub mod delete;
pub mod error;
pub mod index;
pub mod model;
pub mod origin;
pub mod pipeline;
pub mod publish;
pub mod queue;
pub mod retry;
pub mod signal;
pub mod storage;

// Re-export commonly used types
pub use config::MirrorConfig;
pub use error::{SyncError, SyncResult};
pub use model::{Batch, WorkItem};
pub use pipeline::{MirrorPipeline, SyncReport};
pub use signal::ErrorSignal;

use clap::{Parser, Subcommand};

/// aptmirror - APT repository mirror for S3
#[derive(Parser, Debug)]
#[command(name = "aptmirror")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mirror the configured distributions into the bucket
    Sync {
        /// Origin URL (overrides MIRROR_ORIGIN)
        #[arg(long)]
        origin: Option<String>,

        /// Comma separated distributions (overrides MIRROR_DISTS)
        #[arg(long)]
        dists: Option<String>,

        /// Comma separated architectures (overrides MIRROR_ARCHITECTURES)
        #[arg(long)]
        architectures: Option<String>,

        /// Number of content workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Local cache directory
        #[arg(long)]
        cache_dir: Option<String>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete dated backups whose retention has expired
    Purge {
        /// Key prefix to scan (defaults to the destination prefix)
        #[arg(long)]
        prefix: Option<String>,

        /// Number of delete workers
        #[arg(short, long, default_value = "4")]
        workers: usize,
    },
}
