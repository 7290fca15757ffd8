//! proxy-bridge CLI - mount a passthrough bridge onto a backing tree
//!
//! Reads the backing directory from `PROXY_BRIDGE_DST`, mounts the
//! passthrough filesystem at the given mount point, and runs until
//! interrupted or unmounted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use proxy_bridge_fuse::PassthroughFs;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Environment variable naming the backing directory.
const BACKING_ENV: &str = "PROXY_BRIDGE_DST";

#[derive(Debug, Parser)]
#[command(
    name = "proxy-bridge",
    version,
    about = "Re-export a backing directory tree at a mount point"
)]
struct Cli {
    /// Mount point for the bridged tree
    mountpoint: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Stay attached to the terminal (the bridge never daemonizes itself)
    #[arg(short, long)]
    foreground: bool,

    /// Single-threaded request dispatch (accepted for libfuse compatibility)
    #[arg(short, long)]
    singlethread: bool,

    /// Clone the device descriptor per worker (accepted for libfuse compatibility)
    #[arg(long)]
    clone_fd: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let backing = std::env::var_os(BACKING_ENV)
        .map(PathBuf::from)
        .with_context(|| format!("{BACKING_ENV} must name the backing directory"))?;

    info!(
        backing = %backing.display(),
        mountpoint = %cli.mountpoint.display(),
        "starting proxy-bridge"
    );

    if cli.singlethread || cli.clone_fd {
        debug!("dispatch options accepted for compatibility; the session loop dispatches serially");
    }

    let fs = PassthroughFs::new(&backing)
        .with_context(|| format!("failed to open backing directory {}", backing.display()))?;

    let mount_options = vec![
        fuser::MountOption::FSName("proxy-bridge".to_string()),
        fuser::MountOption::AutoUnmount,
        fuser::MountOption::AllowOther,
    ];

    let session = fuser::spawn_mount2(fs, &cli.mountpoint, &mount_options)
        .with_context(|| format!("failed to mount at {}", cli.mountpoint.display()))?;

    info!(mountpoint = %cli.mountpoint.display(), "bridge mounted");
    if !cli.foreground {
        info!("running attached; use a service manager for background operation");
    }

    // Block until ctrl+c or fusermount -u.
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for the shutdown signal")?;

    info!("unmounting");
    session.join();

    Ok(())
}
