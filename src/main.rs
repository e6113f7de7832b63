use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use mqtt_house::logging;
use mqtt_house::ota::staging::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_UPLOAD};
use mqtt_house::ota::web_server::ExitProcess;
use mqtt_house::ota::{OtaWebServer, ServerConfig, StagingArea};
use mqtt_house::version::{CARGO_VERSION, SENTINEL_VERSION};

/// Device-side OTA endpoint: stages uploaded files under the root directory
/// and moves them into place on commit.
#[derive(Parser)]
#[command(name = "mqtt-house-ota-server", version)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:80")]
    bind: String,

    /// Device filesystem root that updates are written into
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Version reported by /ota/about
    #[arg(long = "firmware-version", default_value = SENTINEL_VERSION)]
    firmware_version: String,

    /// Milliseconds between answering /ota/reset and restarting
    #[arg(long, default_value_t = 1000)]
    reset_delay_ms: u64,

    /// Request handler threads
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Largest accepted upload in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD)]
    max_upload: u64,

    /// Increase log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(logging::level_from_verbosity(args.verbose.saturating_add(1)));

    let root = args
        .root
        .canonicalize()
        .with_context(|| format!("device root {} is not accessible", args.root.display()))?;

    let staging = StagingArea::new(&root);
    if staging.exists() {
        info!("Found leftover staging at {}; it stays until rollback or commit", staging.dir().display());
    }

    let config = ServerConfig {
        bind: args.bind,
        root,
        version: args.firmware_version,
        reset_delay: Duration::from_millis(args.reset_delay_ms),
        workers: args.workers.max(1),
        max_upload: args.max_upload,
        chunk_size: DEFAULT_CHUNK_SIZE,
    };

    let server = OtaWebServer::bind(&config, Arc::new(ExitProcess))?;
    info!(
        "mqtt-house-ota-server {} serving {} as firmware {}",
        CARGO_VERSION,
        config.root.display(),
        config.version
    );
    server.spawn().join();
    Ok(())
}
