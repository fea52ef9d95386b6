//! CLI and directive expansion.
//!
//! Grounded on `helper.c` in the original for the semantics of the
//! `server`, `server-bridge`, and `keepalive` directives, and on the
//! teacher's `clap`-based CLI surface (a workspace dependency throughout
//! `relay/server`) for how to expose them idiomatically.

use std::net::Ipv4Addr;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;
use crate::ip_pool::PoolMode;

#[derive(Parser, Debug)]
#[command(name = "vpn-multid", about = "Multi-client VPN broker daemon")]
pub struct Cli {
    /// `server NETWORK NETMASK` — run in TUN point-to-point mode, handing
    /// out addresses from the given `/30`-segmented range.
    #[arg(long, num_args = 2, value_names = ["NETWORK", "NETMASK"])]
    pub server: Option<Vec<Ipv4Addr>>,

    /// `server-bridge NETWORK NETMASK POOL_START POOL_END` — run in TAP
    /// shared-broadcast-domain mode.
    #[arg(long, num_args = 4, value_names = ["NETWORK", "NETMASK", "POOL_START", "POOL_END"])]
    pub server_bridge: Option<Vec<Ipv4Addr>>,

    /// `keepalive PING_EVERY RESTART_AFTER`, expanded server-side per
    /// [`crate::broker::KeepaliveConfig::server_restart_after`].
    #[arg(long, num_args = 2, value_names = ["PING_EVERY", "RESTART_AFTER"], value_parser = humantime::parse_duration)]
    pub keepalive: Option<Vec<Duration>>,

    #[arg(long, default_value_t = 1024)]
    pub max_clients: usize,

    #[arg(long)]
    pub ifconfig_pool_persist: Option<std::path::PathBuf>,

    #[arg(long, default_value = "0.0.0.0:1194")]
    pub listen: std::net::SocketAddr,
}

pub struct Config {
    pub pool_mode: PoolMode,
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub ping_every: Duration,
    pub restart_after: Duration,
    pub max_clients: usize,
    pub ifconfig_pool_persist: Option<std::path::PathBuf>,
    pub listen: std::net::SocketAddr,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if cli.server.is_some() && cli.server_bridge.is_some() {
            return Err(ConfigError::OverlappingDirectives);
        }

        let (pool_mode, network, netmask) = if let Some(args) = &cli.server {
            (PoolMode::Tun, args[0], args[1])
        } else if let Some(args) = &cli.server_bridge {
            (PoolMode::Tap, args[0], args[1])
        } else {
            (
                PoolMode::Tun,
                Ipv4Addr::new(10, 8, 0, 0),
                Ipv4Addr::new(255, 255, 255, 0),
            )
        };

        if u32::from(netmask).leading_ones() == 0 {
            return Err(ConfigError::InvalidMask { mask: netmask });
        }
        if u32::from(network) & !u32::from(netmask) != 0 {
            return Err(ConfigError::NetworkMismatch {
                a: network,
                b: netmask,
            });
        }

        let (ping_every, restart_after) = match &cli.keepalive {
            Some(args) => (args[0], args[1]),
            None => (Duration::from_secs(10), Duration::from_secs(120)),
        };
        if ping_every * 2 > restart_after {
            return Err(ConfigError::BadKeepaliveRatio {
                ping_every,
                restart_after,
            });
        }

        Ok(Self {
            pool_mode,
            network,
            netmask,
            ping_every,
            restart_after,
            max_clients: cli.max_clients,
            ifconfig_pool_persist: cli.ifconfig_pool_persist,
            listen: cli.listen,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            server: None,
            server_bridge: None,
            keepalive: None,
            max_clients: 1024,
            ifconfig_pool_persist: None,
            listen: "0.0.0.0:1194".parse().unwrap(),
        }
    }

    #[test]
    fn server_and_server_bridge_conflict() {
        let mut cli = base_cli();
        cli.server = Some(vec![Ipv4Addr::new(10, 8, 0, 0), Ipv4Addr::new(255, 255, 255, 0)]);
        cli.server_bridge = Some(vec![
            Ipv4Addr::new(10, 9, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(10, 9, 0, 10),
            Ipv4Addr::new(10, 9, 0, 20),
        ]);
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::OverlappingDirectives)
        ));
    }

    #[test]
    fn mismatched_network_and_mask_rejected() {
        let mut cli = base_cli();
        cli.server = Some(vec![Ipv4Addr::new(10, 8, 0, 5), Ipv4Addr::new(255, 255, 255, 0)]);
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::NetworkMismatch { .. })
        ));
    }

    #[test]
    fn bad_keepalive_ratio_rejected() {
        let mut cli = base_cli();
        cli.keepalive = Some(vec![Duration::from_secs(60), Duration::from_secs(90)]);
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::BadKeepaliveRatio { .. })
        ));
    }

    #[test]
    fn defaults_produce_a_valid_config() {
        let cfg = Config::from_cli(base_cli()).unwrap();
        assert_eq!(cfg.pool_mode, PoolMode::Tun);
    }
}
