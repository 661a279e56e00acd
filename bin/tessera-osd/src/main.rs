//! Tessera OSD - blockstore daemon
//!
//! Opens the metadata, journal and data devices, recovers the blockstore
//! and reports what was loaded.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use tessera_common::BlockstoreConfig;
use tessera_storage::{BlockingRing, Blockstore, BlockstoreStatus, NoopFlusher, RawFile};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tessera-osd")]
#[command(about = "Tessera blockstore daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/tessera/osd.toml")]
    config: String,

    /// Data device path
    #[arg(long)]
    data_device: Option<PathBuf>,

    /// Metadata device path (defaults to the data device)
    #[arg(long)]
    meta_device: Option<PathBuf>,

    /// Journal device path (defaults to the metadata device)
    #[arg(long)]
    journal_device: Option<PathBuf>,

    /// Never write to any device
    #[arg(long)]
    readonly: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the status as JSON
    #[arg(long)]
    json: bool,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    blockstore: BlockstoreConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn load_config(path: &str) -> Result<Config> {
    if !std::path::Path::new(path).exists() {
        return Ok(Config::default());
    }
    let config_str =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    toml::from_str(&config_str).with_context(|| format!("failed to parse {path}"))
}

/// Open a device for the blockstore
fn open_device(path: &PathBuf, cfg: &BlockstoreConfig) -> Result<RawFile> {
    RawFile::open(path, cfg.readonly, cfg.devices.direct_io)
        .with_context(|| format!("failed to open {}", path.display()))
}

fn run(args: Args, mut cfg: BlockstoreConfig) -> Result<BlockstoreStatus> {
    if let Some(path) = args.data_device {
        cfg.devices.data_device = path;
    }
    if args.meta_device.is_some() {
        cfg.devices.meta_device = args.meta_device;
    }
    if args.journal_device.is_some() {
        cfg.devices.journal_device = args.journal_device;
    }
    cfg.readonly |= args.readonly;

    if cfg.devices.data_device.as_os_str().is_empty() {
        anyhow::bail!("no data device given, use --data-device or set it in {}", args.config);
    }

    let data = open_device(&cfg.devices.data_device, &cfg)?;
    let meta = open_device(cfg.devices.meta_path(), &cfg)?;
    let journal = open_device(cfg.devices.journal_path(), &cfg)?;

    if cfg.devices.data_size == 0 {
        let size = data.size();
        if size <= cfg.devices.data_offset {
            anyhow::bail!(
                "data offset {} is beyond the end of {} ({} bytes)",
                cfg.devices.data_offset,
                data.path(),
                size
            );
        }
        cfg.devices.data_size = size - cfg.devices.data_offset;
    }

    info!("Data device: {} ({} bytes)", data.path(), cfg.devices.data_size);
    info!("Metadata device: {}", meta.path());
    info!(
        "Journal device: {} ({} bytes at offset {})",
        journal.path(),
        cfg.devices.journal_size,
        cfg.devices.journal_offset
    );
    if cfg.readonly {
        info!("Read-only mode, devices will not be modified");
    }

    let depth = cfg.ring_depth as usize;
    let ring = BlockingRing::new(Box::new(meta), Box::new(journal), Box::new(data), depth);
    let mut store = Blockstore::new(cfg, ring, Box::new(NoopFlusher))?;
    store.run_until_ready()?;
    Ok(store.status())
}

fn print_status(status: &BlockstoreStatus) {
    println!("Blockstore ready: {}", status.ready);
    println!(
        "  Entries loaded: {} metadata, {} journal",
        status.meta_entries_loaded, status.journal_entries_loaded
    );
    println!(
        "  Data blocks:    {} free of {}",
        status.free_blocks, status.total_blocks
    );
    println!(
        "  Journal:        used from {} to {}, {} bytes free",
        status.journal_used_start, status.journal_next_free, status.journal_free_bytes
    );
    println!(
        "  Objects:        {} clean, {} dirty entries, {} unstable",
        status.clean_objects, status.dirty_entries, status.unstable_objects
    );
    for (inode, bytes) in &status.inode_space {
        println!("  Inode {inode:x}: {bytes} bytes");
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };

    // CLI takes precedence over the config file
    let log_level = if args.log_level == "info" {
        config.logging.level.clone()
    } else {
        args.log_level.clone()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting Tessera OSD");
    info!("Config file: {}", args.config);

    let json = args.json;
    let status = match run(args, config.blockstore) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to start blockstore: {:#}", e);
            std::process::exit(1);
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}
