//! Binary entry point: parses configuration, opens the TUN/TAP device,
//! and drives the event loop until a shutdown signal arrives.
//!
//! Matches the teacher's split between a typed library core (this crate's
//! `lib.rs` modules, which return `thiserror`-derived errors) and an
//! `anyhow`-wrapped binary shell that only needs to log-and-exit.

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vpn_multi::broker::{Broker, KeepaliveConfig};
use vpn_multi::config::{Cli, Config};
use vpn_multi::crypto::{CryptoContext, NullCrypto};
use vpn_multi::event_loop::EventLoop;
use vpn_multi::instance::InstanceHandle;
use vpn_multi::ip_pool::IfconfigPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli).context("invalid configuration")?;

    let mut pool = IfconfigPool::new(config.pool_mode, config.network, config.netmask)
        .context("pool range is empty once reserved addresses are excluded")?;
    if let Some(path) = &config.ifconfig_pool_persist {
        pool = pool.with_persistence(path);
        pool.load_persisted().context("failed to load persisted ifconfig pool")?;
    }

    let keepalive = KeepaliveConfig {
        ping_every: config.ping_every,
        restart_after: config.restart_after,
    };
    let broker = Broker::new(pool, keepalive, config.max_clients);

    // Real platform TUN/TAP backends are out of scope; wire a loopback
    // device here so the binary links and runs end to end against the
    // trait boundary this crate does own.
    let device = vpn_multi::tuntap::NullDevice::new(
        match config.pool_mode {
            vpn_multi::ip_pool::PoolMode::Tun => vpn_multi::tuntap::DeviceType::Tun,
            vpn_multi::ip_pool::PoolMode::Tap => vpn_multi::tuntap::DeviceType::Tap,
        },
        1500,
    );

    let make_crypto = |_: &InstanceHandle| -> Box<dyn CryptoContext> { Box::new(NullCrypto::new(0)) };

    let mut event_loop = EventLoop::bind(config.listen, device, broker, make_crypto)
        .await
        .context("failed to bind listener")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    event_loop.run(shutdown_rx).await;

    Ok(())
}
