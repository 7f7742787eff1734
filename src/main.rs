//! Blobstream daemon
//!
//! Stores content as encrypted, content-addressed blob chunks and serves
//! it back as HTTP byte ranges.
//!
//! ## Usage
//!
//! ```bash
//! # Publish a local file as a stream
//! blobstream publish video.mp4 --name my-video
//!
//! # Serve ranges over HTTP
//! blobstream serve
//!
//! # Serve without ever materializing files
//! blobstream serve --streaming-only
//!
//! # List known streams / delete one
//! blobstream list
//! blobstream delete <sd_hash> --delete-from-download-dir
//! ```
//!
//! ## HTTP API
//!
//! - `GET  /get/{name}` - stream bytes (optional `Range: bytes=a-b`)
//! - `HEAD /get/{name}` - size and range headers only
//! - `GET  /health`     - node statistics

use anyhow::Context;
use blobstream::manager::RegistryResolver;
use blobstream::source::{NullSource, RuntimeFlags};
use blobstream::{BlobStore, Config, HttpServer, StreamManager, StreamRegistry};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "blobstream")]
#[command(about = "Encrypted chunked-stream storage daemon")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(long, env = "BLOBSTREAM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP range server
    Serve {
        /// HTTP API port
        #[arg(long, env = "BLOBSTREAM_HTTP_PORT")]
        http_port: Option<u16>,

        /// Serve ranges without materializing stream files
        #[arg(long)]
        streaming_only: bool,

        /// Do not retain fetched blobs on disk
        #[arg(long)]
        no_save_blobs: bool,

        /// Directory for materialized stream files
        #[arg(long)]
        download_dir: Option<PathBuf>,
    },

    /// Chunk, encrypt and register a local file as a stream
    Publish {
        /// File to publish
        file: PathBuf,

        /// Name the stream resolves under
        #[arg(long)]
        name: String,
    },

    /// List known streams
    List,

    /// Delete a stream and the blobs only it references
    Delete {
        /// Stream identity (descriptor hash)
        sd_hash: String,

        /// Also remove the materialized file
        #[arg(long)]
        delete_from_download_dir: bool,
    },
}

struct Node {
    manager: Arc<StreamManager>,
    registry: Arc<StreamRegistry>,
    store: Arc<BlobStore>,
}

async fn build_node(config: &Config, flags: Arc<RuntimeFlags>) -> anyhow::Result<Node> {
    let store = Arc::new(BlobStore::new(config.blob_dir()).await?);
    let registry = Arc::new(StreamRegistry::open(config.registry_path())?);
    let manager = Arc::new(StreamManager::new(
        store.clone(),
        Arc::new(NullSource),
        registry.clone(),
        flags,
        config.download_dir(),
    ));
    manager.start().await?;
    Ok(Node {
        manager,
        registry,
        store,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("blobstream=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    // Load config
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))?
    } else {
        Config::default()
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    tokio::fs::create_dir_all(&config.data_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    match cli.command {
        Command::Serve {
            http_port,
            streaming_only,
            no_save_blobs,
            download_dir,
        } => {
            if let Some(port) = http_port {
                config.http_port = port;
            }
            if streaming_only {
                config.streaming_only = true;
            }
            if no_save_blobs {
                config.save_blobs = false;
            }
            if let Some(dir) = download_dir {
                config.download_dir = Some(dir);
            }
            serve(config).await
        }
        Command::Publish { file, name } => publish(config, file, name).await,
        Command::List => list(config).await,
        Command::Delete {
            sd_hash,
            delete_from_download_dir,
        } => delete(config, sd_hash, delete_from_download_dir).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!(
        data_dir = %config.data_dir.display(),
        http_port = config.http_port,
        save_blobs = config.save_blobs,
        streaming_only = config.streaming_only,
        "Starting blobstream"
    );

    let flags = Arc::new(RuntimeFlags::new(config.save_blobs, config.streaming_only));
    let node = build_node(&config, flags).await?;
    let resolver = Arc::new(RegistryResolver::new(node.registry.clone()));

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(node.manager.clone(), resolver, http_addr));

    info!("HTTP API available at http://{}", http_addr);
    info!("  GET  /get/{{name}}  - stream bytes (supports Range)");
    info!("  HEAD /get/{{name}}  - headers only");
    info!("  GET  /health      - node statistics");
    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    node.manager.stop().await?;

    if let Ok(stats) = node.store.stats().await {
        info!(
            blobs = stats.total_blobs,
            bytes = stats.total_bytes,
            "Final storage stats"
        );
    }

    Ok(())
}

async fn publish(config: Config, file: PathBuf, name: String) -> anyhow::Result<()> {
    let flags = Arc::new(RuntimeFlags::new(true, config.streaming_only));
    let node = build_node(&config, flags).await?;

    let data = tokio::fs::read(&file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| name.clone());

    let stream = node.manager.publish(&data, &name, &file_name).await?;
    println!("{}", stream.sd_hash);
    Ok(())
}

async fn list(config: Config) -> anyhow::Result<()> {
    let flags = Arc::new(RuntimeFlags::new(config.save_blobs, config.streaming_only));
    let node = build_node(&config, flags).await?;

    let listings = node.manager.list_streams().await;
    println!("{}", serde_json::to_string_pretty(&listings)?);
    Ok(())
}

async fn delete(
    config: Config,
    sd_hash: String,
    delete_from_download_dir: bool,
) -> anyhow::Result<()> {
    let flags = Arc::new(RuntimeFlags::new(config.save_blobs, config.streaming_only));
    let node = build_node(&config, flags).await?;

    node.manager
        .delete_stream(&sd_hash, delete_from_download_dir)
        .await?;
    println!("deleted {}", sd_hash);
    Ok(())
}
