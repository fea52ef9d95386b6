//! Virtual-address allocation pool.
//!
//! Grounded on `ifconfig_pool` in the original: for TUN mode the bottom
//! four addresses (network, the server's own `NET+1`, and the `.2`/`.3`
//! pair reserved alongside it) are skipped and the pool hands out
//! `[NET+4, broadcast-4]`, leaving four more at the top free for the
//! same kind of reservation on the far side; for TAP mode the whole
//! `[base+2, broadcast-1]` range is handed out directly since clients
//! share the one broadcast domain. Persistence across restarts (so a
//! reconnecting client gets its old address back) is atomic file-replace
//! via the `atomicwrites` crate, matching how a production daemon must
//! never leave a half-written pool file behind after a crash
//! mid-checkpoint.

use crate::error::PoolError;
use atomicwrites::{AtomicFile, OverwriteBehavior::AllowOverwrite};
use std::collections::HashMap;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::instance::ClientId;

/// Addresses reserved at either end of the TUN pool range: four at the
/// bottom (network, `NET+1`, `NET+2`, `NET+3`) before `base`, and four at
/// the top (up to and including the subnet broadcast) past `end`.
const TUN_POOL_END_RESERVE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Point-to-point, one `/30` per client.
    Tun,
    /// Shared broadcast domain, one address per client.
    Tap,
}

pub struct IfconfigPool {
    mode: PoolMode,
    base: u32,
    end: u32,
    in_use: HashMap<u32, ClientId>,
    /// Sticky assignment: a client that reconnects with the same id gets
    /// the same address back, as long as it's still free.
    assigned_to_client: HashMap<ClientId, u32>,
    persist_path: Option<PathBuf>,
}

impl IfconfigPool {
    /// `network`/`netmask` describe the pool's address range. Returns
    /// [`crate::error::ConfigError::EmptyPool`]-equivalent failure as `None` if,
    /// once reserved addresses are excluded, nothing is left to hand out.
    pub fn new(mode: PoolMode, network: Ipv4Addr, netmask: Ipv4Addr) -> Option<Self> {
        let network = u32::from(network);
        let netmask = u32::from(netmask);
        let broadcast = network | !netmask;

        let (base, end) = match mode {
            PoolMode::Tun => (
                network + TUN_POOL_END_RESERVE,
                broadcast.saturating_sub(TUN_POOL_END_RESERVE),
            ),
            PoolMode::Tap => (network + 2, broadcast.saturating_sub(1)),
        };

        if base > end {
            return None;
        }

        Some(Self {
            mode,
            base,
            end,
            in_use: HashMap::new(),
            assigned_to_client: HashMap::new(),
            persist_path: None,
        })
    }

    pub fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    pub fn capacity(&self) -> u32 {
        self.end - self.base + 1
    }

    pub fn free_count(&self) -> u32 {
        self.capacity() - self.in_use.len() as u32
    }

    /// Assign an address to `client`. Prefers the client's previously
    /// assigned address if it's still free; otherwise takes the lowest
    /// free address in the range.
    pub fn assign(&mut self, client: ClientId) -> Result<Ipv4Addr, PoolError> {
        if let Some(&addr) = self.assigned_to_client.get(&client) {
            if !self.in_use.contains_key(&addr) {
                self.in_use.insert(addr, client);
                return Ok(Ipv4Addr::from(addr));
            }
        }

        let addr = (self.base..=self.end)
            .find(|a| !self.in_use.contains_key(a))
            .ok_or(PoolError::Exhausted)?;

        self.in_use.insert(addr, client);
        self.assigned_to_client.insert(client, addr);
        Ok(Ipv4Addr::from(addr))
    }

    /// Free the address held by `client`, if any. Does not forget the
    /// sticky mapping, so a later `assign` for the same client still
    /// prefers it.
    pub fn release(&mut self, client: ClientId) {
        if let Some(&addr) = self.assigned_to_client.get(&client) {
            self.in_use.remove(&addr);
        }
    }

    pub fn holder_of(&self, addr: Ipv4Addr) -> Option<ClientId> {
        self.in_use.get(&u32::from(addr)).copied()
    }

    /// Serialize `client-id,a.b.c.d` pairs and atomically replace the
    /// persistence file, if one is configured. A no-op otherwise.
    pub fn checkpoint(&self) -> std::io::Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let mut buf = String::new();
        for (&addr, &client) in &self.in_use {
            buf.push_str(&format!("{},{}\n", client.0, Ipv4Addr::from(addr)));
        }
        write_atomic(path, buf.as_bytes())
    }

    /// Reload `client-id,a.b.c.d` sticky assignments from the persisted
    /// file, if one is configured and exists. Addresses outside the
    /// current pool range are silently skipped (the range may have
    /// shrunk since the file was written).
    pub fn load_persisted(&mut self) -> std::io::Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let Ok(contents) = std::fs::read_to_string(path) else {
            return Ok(());
        };
        for line in contents.lines() {
            let Some((id_str, addr_str)) = line.split_once(',') else {
                continue;
            };
            let (Ok(id), Ok(addr)) = (id_str.parse::<u64>(), addr_str.parse::<Ipv4Addr>()) else {
                continue;
            };
            let addr = u32::from(addr);
            if (self.base..=self.end).contains(&addr) {
                self.assigned_to_client.insert(ClientId(id), addr);
            }
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let file = AtomicFile::new(path, AllowOverwrite);
    file.write(|f| f.write_all(contents))
        .map_err(|e| match e {
            atomicwrites::Error::Internal(io_err) => io_err,
            atomicwrites::Error::User(io_err) => io_err,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: u64) -> ClientId {
        ClientId(id)
    }

    #[test]
    fn tun_pool_reserves_bottom_and_top() {
        let pool = IfconfigPool::new(
            PoolMode::Tun,
            Ipv4Addr::new(10, 8, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
        )
        .unwrap();
        // network=.0, base=.4, broadcast=.255, end=.255-4=.251
        assert_eq!(pool.capacity(), 248);
    }

    #[test]
    fn tap_pool_uses_base_plus_two() {
        let pool = IfconfigPool::new(
            PoolMode::Tap,
            Ipv4Addr::new(10, 8, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
        )
        .unwrap();
        assert_eq!(pool.capacity(), 253);
    }

    #[test]
    fn assign_then_release_frees_the_slot() {
        let mut pool = IfconfigPool::new(
            PoolMode::Tap,
            Ipv4Addr::new(10, 8, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
        )
        .unwrap();
        let a = pool.assign(client(1)).unwrap();
        assert_eq!(pool.free_count(), pool.capacity() - 1);

        pool.release(client(1));
        assert_eq!(pool.free_count(), pool.capacity());
        assert_eq!(pool.holder_of(a), None);
    }

    #[test]
    fn reconnecting_client_gets_same_address() {
        let mut pool = IfconfigPool::new(
            PoolMode::Tap,
            Ipv4Addr::new(10, 8, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
        )
        .unwrap();
        let first = pool.assign(client(1)).unwrap();
        pool.release(client(1));
        let second = pool.assign(client(1)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn exhausted_pool_errors() {
        let mut pool = IfconfigPool::new(
            PoolMode::Tap,
            Ipv4Addr::new(10, 8, 0, 0),
            Ipv4Addr::new(255, 255, 255, 252),
        )
        .unwrap();
        // /30 TAP pool: base+2..broadcast-1 leaves exactly one address.
        assert_eq!(pool.capacity(), 1);
        pool.assign(client(1)).unwrap();
        assert_eq!(pool.assign(client(2)), Err(PoolError::Exhausted));
    }

    #[test]
    fn empty_pool_range_rejected_at_construction() {
        let pool = IfconfigPool::new(
            PoolMode::Tun,
            Ipv4Addr::new(10, 8, 0, 0),
            Ipv4Addr::new(255, 255, 255, 255),
        );
        assert!(pool.is_none());
    }

    #[test]
    fn checkpoint_and_reload_roundtrip() {
        let dir = std::env::temp_dir().join(format!("vpn-multi-pool-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ifconfig-pool.txt");

        let mut pool = IfconfigPool::new(
            PoolMode::Tap,
            Ipv4Addr::new(10, 8, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
        )
        .unwrap()
        .with_persistence(&path);
        let addr = pool.assign(client(42)).unwrap();
        pool.checkpoint().unwrap();

        let mut reloaded = IfconfigPool::new(
            PoolMode::Tap,
            Ipv4Addr::new(10, 8, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
        )
        .unwrap()
        .with_persistence(&path);
        reloaded.load_persisted().unwrap();
        let reassigned = reloaded.assign(client(42)).unwrap();

        assert_eq!(addr, reassigned);
        std::fs::remove_dir_all(&dir).ok();
    }
}
