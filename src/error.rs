//! Error taxonomy for the broker core.
//!
//! Mirrors the kinds from the design doc rather than inventing one giant
//! enum: packet-path errors stay local (drop / close one instance),
//! configuration errors fail fast at startup, and resource-exhaustion
//! never tears down existing peers.

use std::net::Ipv4Addr;

/// Errors that terminate a single [`crate::instance::Instance`] but leave every other
/// peer untouched (the "peer-fatal" kind from the design doc).
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum ForwardError {
    #[error("crypto context rejected the packet")]
    BadPacket,
    #[error("replay detected")]
    ReplayDetected,
    #[error("TCP framing violation, resetting stream")]
    FramingViolation,
    #[error("source address does not match the instance's assigned virtual address")]
    SourceSpoofed,
    #[error("source MAC collides with a configured iroute")]
    LearnedRouteConflict,
}

/// Resource-exhaustion: reject the new peer or drop the packet, never tear
/// down an existing one.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum ResourceError {
    #[error("virtual address pool exhausted")]
    PoolExhausted,
    #[error("max_clients reached")]
    MaxClients,
    #[error("output queue is full, packet dropped")]
    QueueFull,
}

/// Configuration errors surface once, at startup, as a single-line
/// human-readable message.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("invalid network mask {mask}")]
    InvalidMask { mask: Ipv4Addr },
    #[error("{a} and {b} do not share the same network/mask")]
    NetworkMismatch { a: Ipv4Addr, b: Ipv4Addr },
    #[error("keepalive ping-every ({ping_every:?}) must be at most half of restart-after ({restart_after:?})")]
    BadKeepaliveRatio {
        ping_every: std::time::Duration,
        restart_after: std::time::Duration,
    },
    #[error("server and client directives cannot both be set")]
    OverlappingDirectives,
    #[error("pool range [{base}, {end}] is empty once reserved addresses are excluded")]
    EmptyPool { base: Ipv4Addr, end: Ipv4Addr },
}

/// Errors from the IP pool itself (distinct from [`ConfigError`] because
/// pool exhaustion is a steady-state, not a startup, condition).
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum PoolError {
    #[error("no free address remains in the pool")]
    Exhausted,
}

/// System-fatal: the caller should log and exit with a nonzero status.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("listener socket unusable: {0}")]
    Listener(#[source] std::io::Error),
    #[error("TUN/TAP device disappeared: {0}")]
    Device(#[source] std::io::Error),
}
