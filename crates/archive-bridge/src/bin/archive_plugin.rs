//! archive-plugin: serves the archive capability to a host process.
//!
//! Launched by a host with the handshake cookie in its environment. Prints one
//! address line on stdout, then serves every host connection on that socket.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use archive_bridge::telemetry::init_tracing;
use archive_bridge::{
    ARCHIVE_HANDSHAKE, Archive, ArchivePlugin, BridgeError, Outcome, PluginConfig, PluginSocket,
    serve,
};

/// Copies each named file into a target directory.
struct DirectoryArchive {
    dir: PathBuf,
}

impl DirectoryArchive {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    async fn archive(&self, source: &Path) -> std::io::Result<PathBuf> {
        let file_name = source.file_name().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} does not name a file", source.display()),
            )
        })?;
        let target = self.dir.join(file_name);
        tokio::fs::copy(source, &target).await?;
        Ok(target)
    }
}

#[async_trait]
impl Archive for DirectoryArchive {
    async fn execute(&self, payload: &str) -> Outcome {
        if payload.is_empty() {
            return Outcome::failed("empty payload");
        }

        match self.archive(Path::new(payload)).await {
            Ok(target) => {
                tracing::info!(payload, target = %target.display(), "Archived");
                Outcome::success()
            }
            Err(e) => {
                tracing::warn!(payload, error = %e, "Archive failed");
                Outcome::failed(e.to_string())
            }
        }
    }
}

fn archive_dir() -> PathBuf {
    std::env::var_os("ARCHIVE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("archive"))
}

async fn run() -> anyhow::Result<()> {
    let dir = archive_dir();
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating archive directory {}", dir.display()))?;

    let plugin = Arc::new(ArchivePlugin::new(Arc::new(DirectoryArchive::new(dir.clone()))));
    let config = Arc::new(PluginConfig::default());
    let socket = PluginSocket::bind().context("binding plugin socket")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        dir = %dir.display(),
        socket = %socket.path().display(),
        "archive-plugin started"
    );
    println!("{}", socket.address_line(config.handshake.protocol_version));

    loop {
        let stream = tokio::select! {
            accepted = socket.accept() => accepted.context("accepting host connection")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        };

        let plugin = Arc::clone(&plugin);
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            match serve(plugin.as_ref(), stream, &config).await {
                Ok(()) => tracing::debug!("Host disconnected"),
                Err(BridgeError::Handshake(e)) => {
                    tracing::warn!(error = %e, "Refused host connection")
                }
                Err(e) => tracing::error!(error = %e, "Connection ended with error"),
            }
        });
    }

    Ok(())
}

fn main() -> ExitCode {
    if ARCHIVE_HANDSHAKE.verify_env().is_err() {
        eprintln!(
            "This binary is a plugin. It is not meant to be executed directly; \
             run the host application that loads it instead."
        );
        return ExitCode::FAILURE;
    }

    init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "archive-plugin failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
