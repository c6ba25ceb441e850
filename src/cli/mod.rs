//! Command-line interface for osbroker.
//!
//! `serve` wires the broker together and runs it until interrupted.
//! `catalog` and `config` print what a `serve` with the same settings
//! would use.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{BasicAuth, HttpServer};
use crate::config::Config;
use crate::core::{AsyncEngine, Broker, BrokerError, FatalSignal, Lifecycle, LocalEngine};
use crate::crypto::{codec_for_scheme, CodecCell};
use crate::service::{catalog_from_modules, Catalog};
use crate::services::enabled_modules;
use crate::storage::open_store;

/// osbroker - Open Service Broker with pluggable service modules
#[derive(Parser, Debug)]
#[command(name = "osbroker")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the broker API and async engine
    Serve {
        /// Config file (defaults to .osb/config.yaml in this or a parent directory)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the catalog as served on /v2/catalog
    Catalog {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show resolved configuration with secrets redacted
    Config {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve { config } => serve(config.as_deref()).await,
            Commands::Catalog { config } => show_catalog(config.as_deref()),
            Commands::Config { config } => show_config(config.as_deref()),
        }
    }
}

fn build_catalog(config: &Config) -> Result<Arc<Catalog>> {
    let modules = enabled_modules(&config.catalog);
    let catalog = catalog_from_modules(&modules).context("Failed to build catalog")?;
    Ok(Arc::new(catalog))
}

async fn serve(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;
    match &config.config_file {
        Some(path) => info!(path = %path.display(), "Loaded config"),
        None => info!("No config file found, using defaults and environment"),
    }

    let codecs = CodecCell::new();
    codecs.install(codec_for_scheme(
        config.crypto.encryption_scheme,
        &config.crypto.aes256.key,
    )?)?;
    info!(scheme = %config.crypto.encryption_scheme, "Installed record codec");

    let catalog = build_catalog(&config)?;
    info!(services = catalog.len(), "Catalog ready");

    let store = open_store(&config.storage, codecs.get()?, catalog.clone())
        .await
        .context("Failed to open store")?;

    let fatal = FatalSignal::new();
    let engine: Arc<dyn AsyncEngine> = Arc::new(LocalEngine::new(
        store.clone(),
        fatal.clone(),
        config.engine.queue_capacity,
        config.engine.drain_timeout(),
    ));
    let lifecycle = Lifecycle::new(catalog, store.clone(), engine.clone(), fatal.clone());

    let basic_auth = &config.api.basic_auth;
    let auth = if basic_auth.username.is_empty() {
        tracing::warn!("Basic auth is disabled");
        None
    } else {
        Some(BasicAuth::new(&basic_auth.username, &basic_auth.password))
    };
    let api = Arc::new(HttpServer::new(config.api.port, lifecycle, auth));

    let broker = Broker::new(api, engine, store, fatal, config.engine.drain_timeout())
        .await
        .context("Store is not reachable")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
            }
            cancel.cancel();
        });
    }

    match broker.run(cancel).await {
        BrokerError::Cancelled => Ok(()),
        stopped => Err(stopped).context("Broker stopped"),
    }
}

fn show_catalog(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;
    let catalog = build_catalog(&config)?;
    println!("{}", serde_json::to_string_pretty(&catalog.to_api())?);
    Ok(())
}

fn show_config(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;

    println!(
        "# Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    print!("{}", serde_yaml::to_string(&config.redacted())?);
    Ok(())
}
