//! aptmirror - Main entry point

use anyhow::Context;
use aptmirror::config::split_list;
use aptmirror::delete::purge_expired;
use aptmirror::origin::http::HttpOrigin;
use aptmirror::storage::{S3Connector, StorageConfig, StoreConnector};
use aptmirror::{Cli, Commands, MirrorConfig, MirrorPipeline};
use aptmirror_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("aptmirror")
        .build();

    // Environment takes precedence
    let log_config = match log_config.merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Ignoring invalid logging environment: {:#}", e);
            LogConfig::default()
        },
    };

    // Held until main returns so buffered file output is flushed on every exit path
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            None
        },
    };

    match execute_command(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        },
    }
}

/// Execute the CLI command, returning the process exit code
async fn execute_command(cli: &Cli) -> anyhow::Result<u8> {
    let storage = StorageConfig::from_env().context("Failed to load storage configuration")?;
    let mut config = MirrorConfig::load().context("Failed to load mirror configuration")?;

    match &cli.command {
        Commands::Sync {
            origin,
            dists,
            architectures,
            workers,
            cache_dir,
            json,
        } => {
            if let Some(origin) = origin {
                config.origin.url = origin.clone();
            }
            if let Some(dists) = dists {
                config.mirror.dists = split_list(dists);
            }
            if let Some(architectures) = architectures {
                config.mirror.architectures = split_list(architectures);
            }
            if let Some(workers) = workers {
                config.workers.content_workers = *workers;
            }
            if let Some(cache_dir) = cache_dir {
                config.cache_dir = PathBuf::from(cache_dir);
            }
            config.validate()?;

            sync(config, storage, *json).await
        },

        Commands::Purge { prefix, workers } => {
            let prefix = prefix.clone().unwrap_or_else(|| config.mirror.dest_prefix.clone());
            let store = S3Connector::new(storage).connect().await?;
            let today = chrono::Utc::now().date_naive();

            let stats = purge_expired(store, &prefix, today, *workers).await?;
            Ok(if stats.failed == 0 { 0 } else { 1 })
        },
    }
}

async fn sync(config: MirrorConfig, storage: StorageConfig, json: bool) -> anyhow::Result<u8> {
    info!(
        origin = %config.origin.base_url(),
        bucket = %storage.bucket,
        dists = ?config.mirror.dists,
        "Starting mirror run"
    );

    let origin = HttpOrigin::new(Duration::from_secs(config.origin.timeout_secs))?;
    let pipeline = MirrorPipeline::new(config, Arc::new(S3Connector::new(storage)), Arc::new(origin));

    let signal = pipeline.signal().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight work");
            signal.raise("interrupted");
        }
    });

    let report = pipeline.run().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(report.exit_code())
}
