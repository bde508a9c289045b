//! The host agent: runs losetup on behalf of one LXD container.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
};

use losetup_proxy::{
    command::HostRunner,
    lxc::{rootfs_path, Lxc},
    protocol::DEFAULT_PORT,
    server::{bind, container_listen_address, AgentConfig, Server},
};

/// losetup-server
#[derive(Debug, Parser)]
#[clap(name = "losetup-server", version)]
struct Args {
    /// Name of the LXD container to serve
    container: String,
    /// Port to listen on
    #[clap(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Log every request in detail
    #[clap(long)]
    debug: bool,
    /// Storage pool holding the container
    #[clap(long, default_value = "default")]
    storage_pool: String,
    /// Host path of the container's root filesystem (default: derived from the storage pool)
    #[clap(long)]
    rootfs: Option<PathBuf>,
    /// Address to listen on (default: the address of the container's bridge)
    #[clap(long)]
    listen: Option<IpAddr>,
    /// losetup executable to run
    #[clap(long, default_value = "losetup")]
    losetup: String,
    /// lxc executable to run
    #[clap(long, default_value = "lxc")]
    lxc: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    if !rustix::process::getuid().is_root() {
        log::warn!("Not running as root: losetup and lxc will probably fail");
    }

    let lxc = Lxc { program: args.lxc };
    let rootfs = args
        .rootfs
        .unwrap_or_else(|| rootfs_path(&args.storage_pool, &args.container));

    let address = match args.listen {
        Some(address) => address,
        None => {
            let (bridge, address) = container_listen_address(&HostRunner, &lxc, &args.container)
                .await
                .with_context(|| format!("Finding the network of container {}", args.container))?;
            log::info!("Container {} is on {bridge} ({address})", args.container);
            address.into()
        }
    };

    let listener = bind(SocketAddr::new(address, args.port)).await?;
    log::info!(
        "Serving container {} (rootfs {}) on {}",
        args.container,
        rootfs.display(),
        listener.local_addr()?
    );

    let mut terminate = signal(SignalKind::terminate()).context("Installing SIGTERM handler")?;
    let (stop_sender, stop) = watch::channel(false);
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
        log::info!("Shutting down");
        stop_sender.send_replace(true);
    });

    let config = AgentConfig {
        container: args.container,
        rootfs,
        losetup: args.losetup,
        lxc,
    };
    Server::new(config, HostRunner).serve(listener, stop).await
}
