//! A single learned or configured route to an [`crate::instance::Instance`].

use std::time::{Duration, Instant};

use crate::instance::InstanceHandle;

/// How a route came to exist, carried only for diagnostics/logging —
/// collapsed from the original's per-route `MULTI_ROUTE_*` wire flags
/// since those flags themselves are out of scope here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    /// Statically configured via an `iroute` directive.
    Iroute,
    /// Learned by observing traffic from the TUN/TAP side.
    Learned,
    /// Copied in from the persisted host-route cache.
    HostCache,
}

/// Whether a route expires on its own (a learned client MAC/IP) or lives
/// as long as its target instance does (a static `iroute`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    Cache { generation: u64 },
    Ageable { learned_at: Instant, ttl: Duration },
    Permanent,
}

pub struct Route {
    pub target: InstanceHandle,
    pub source: RouteSource,
    pub lifetime: Lifetime,
}

impl Route {
    pub fn new(target: InstanceHandle, source: RouteSource, lifetime: Lifetime) -> Self {
        Self {
            target,
            source,
            lifetime,
        }
    }

    /// A route is valid iff its target instance hasn't been halted, and
    /// (depending on its lifetime kind) its cache generation still
    /// matches or it hasn't aged out.
    pub fn is_valid(&self, now: Instant, current_cache_generation: u64) -> bool {
        if self.target.borrow().is_halted() {
            return false;
        }
        match self.lifetime {
            Lifetime::Cache { generation } => generation == current_cache_generation,
            Lifetime::Ageable { learned_at, ttl } => now.duration_since(learned_at) <= ttl,
            Lifetime::Permanent => true,
        }
    }
}
