use std::process;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use santa_sleigh::cli::Args;
use santa_sleigh::cloud::S3Uploader;
use santa_sleigh::config::DaemonConfig;
use santa_sleigh::logging::init_logging;
use santa_sleigh::shipper::{Context, Daemon};

fn main() {
    let args = Args::parse();

    let config = match DaemonConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("santa-sleigh: {:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("santa-sleigh: {:#}", e);
        process::exit(1);
    }

    if let Err(e) = run(config) {
        error!("santa-sleigh exited with error: {:#}", e);
        process::exit(1);
    }
}

fn run(config: DaemonConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(async move {
        let uploader = S3Uploader::new(&config.storage, config.upload.max_retries)
            .context("Failed to create S3 uploader")?;
        let cancel = CancellationToken::new();
        tokio::spawn(watch_signals(cancel.clone()));

        let mut daemon = Daemon::new(config, Arc::new(uploader), Context::system());
        daemon.run(cancel).await
    })
}

/// Cancel on SIGINT or SIGTERM
#[cfg(unix)]
async fn watch_signals(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = term.recv() => info!("received SIGTERM"),
            }
        }
        Err(e) => {
            log::warn!("Failed to install SIGTERM handler, only SIGINT will stop the daemon: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            info!("received SIGINT");
        }
    }
    cancel.cancel();
}

#[cfg(not(unix))]
async fn watch_signals(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received Ctrl-C");
    }
    cancel.cancel();
}
