//! The `Broker`: owning store of every live [`crate::instance::Instance`],
//! its address indexes, its pending-connection slot, and the reaper state
//! that walks the indexes a few buckets at a time instead of sweeping the
//! whole table every tick.
//!
//! Grounded on `multi_context` in `openvpn/multi.h` generalized to the
//! sans-IO `Server` shape in `relay/server/src/server.rs`: state lives
//! here, side effects (send a packet, arm a timer) are described rather
//! than performed, and an outer driver (see [`crate::event_loop`]) carries
//! them out.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::addr_key::AddrKey;
use crate::error::{ConfigError, ResourceError};
use crate::hash_index::HashIndex;
use crate::instance::{ClientId, Instance, InstanceHandle};
use crate::ip_pool::IfconfigPool;
use crate::mroute::MRoute;
use crate::route::{Lifetime, Route, RouteSource};
use crate::schedule::{Schedule, ScheduleId};
use std::cell::RefCell;
use std::rc::Rc;

/// Clamp for how many buckets the reaper visits per pass: enough to make
/// steady progress on a large table, not so many that one reaper tick
/// stalls the event loop.
const REAPER_MIN_BUCKETS: usize = 16;
const REAPER_MAX_BUCKETS: usize = 1024;

pub enum Command {
    SendTo {
        to: SocketAddr,
        payload: Vec<u8>,
    },
    WriteTun {
        frame: Vec<u8>,
    },
    ArmTimer {
        deadline: Instant,
    },
    CloseInstance {
        client_id: ClientId,
    },
}

pub struct KeepaliveConfig {
    pub ping_every: Duration,
    pub restart_after: Duration,
}

impl KeepaliveConfig {
    /// Server-mode doubles the client-facing `restart_after` server-side,
    /// matching the original's keepalive-expansion helper directive: the
    /// server gives a client more slack than it enforces on itself.
    pub fn server_restart_after(&self) -> Duration {
        self.restart_after * 2
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_every * 2 > self.restart_after {
            return Err(ConfigError::BadKeepaliveRatio {
                ping_every: self.ping_every,
                restart_after: self.restart_after,
            });
        }
        Ok(())
    }
}

pub struct Broker {
    real_index: HashIndex<AddrKey, InstanceHandle>,
    virt_index: HashIndex<AddrKey, InstanceHandle>,
    routes: HashIndex<AddrKey, Route>,
    schedule: Schedule,
    mroute: MRoute,
    pool: IfconfigPool,
    keepalive: KeepaliveConfig,
    pending_commands: std::collections::VecDeque<Command>,
    max_clients: usize,
    reaper_bucket_base: usize,
    reaper_buckets_per_pass: usize,
}

impl Broker {
    pub fn new(pool: IfconfigPool, keepalive: KeepaliveConfig, max_clients: usize) -> Self {
        Self {
            real_index: HashIndex::new(),
            virt_index: HashIndex::new(),
            routes: HashIndex::new(),
            schedule: Schedule::new(),
            mroute: MRoute::new(),
            pool,
            keepalive,
            pending_commands: std::collections::VecDeque::new(),
            max_clients,
            reaper_bucket_base: 0,
            reaper_buckets_per_pass: REAPER_MIN_BUCKETS,
        }
    }

    pub fn instance_count(&self) -> usize {
        self.real_index.len()
    }

    pub fn next_command(&mut self) -> Option<Command> {
        self.pending_commands.pop_front()
    }

    fn push_command(&mut self, cmd: Command) {
        self.pending_commands.push_back(cmd);
    }

    /// Accept a brand-new peer at `real_addr`. Rejects once `max_clients`
    /// is reached or the virtual-address pool is exhausted, in which case
    /// no instance is created and no existing peer is affected.
    pub fn create_instance(
        &mut self,
        client_id: ClientId,
        real_addr: SocketAddr,
        now: Instant,
    ) -> Result<InstanceHandle, ResourceError> {
        if self.real_index.len() >= self.max_clients {
            return Err(ResourceError::MaxClients);
        }

        let virtual_addr = self
            .pool
            .assign(client_id)
            .map_err(|_| ResourceError::PoolExhausted)?;

        let mut instance = Instance::new(client_id, real_addr, now);
        instance.mark_established(std::net::IpAddr::V4(virtual_addr));
        instance.incref();
        let handle: InstanceHandle = Rc::new(RefCell::new(instance));

        let real_key = handle.borrow().real_addr_key().expect("real addr set");
        let virt_key = handle.borrow().virtual_addr_key().expect("virtual addr set");
        self.real_index.insert(real_key, handle.clone());
        self.virt_index.insert(virt_key, handle.clone());

        let deadline = now + self.keepalive.server_restart_after();
        let schedule_id = self.schedule.insert(deadline);
        handle.borrow_mut().schedule_id = Some(schedule_id);

        self.push_command(Command::ArmTimer { deadline });

        Ok(handle)
    }

    /// Tear down an instance: mark it halted (so any in-flight route
    /// lookups see it as dead immediately), release its pool address,
    /// drop it from both indexes, and cancel its schedule entry.
    pub fn close_instance(&mut self, handle: &InstanceHandle) {
        let client_id = {
            let mut inst = handle.borrow_mut();
            inst.mark_halted();
            if let Some(id) = inst.schedule_id.take() {
                self.schedule.remove(id);
            }
            inst.client_id
        };

        self.pool.release(client_id);

        let real_key = handle.borrow().real_addr_key();
        let virt_key = handle.borrow().virtual_addr_key();
        if let Some(k) = real_key {
            self.real_index.remove(&k);
        }
        if let Some(k) = virt_key {
            self.virt_index.remove(&k);
        }

        self.push_command(Command::CloseInstance { client_id });
    }

    pub fn lookup_by_real_addr(&self, addr: SocketAddr) -> Option<&InstanceHandle> {
        let key = AddrKey::from_socket_addr(addr, true);
        self.real_index.lookup(&key)
    }

    pub fn lookup_by_virtual_addr(&self, key: &AddrKey) -> Option<&InstanceHandle> {
        self.virt_index.lookup(key)
    }

    pub fn iter_real_index(&self) -> impl Iterator<Item = (&AddrKey, &InstanceHandle)> {
        self.real_index.iter()
    }

    pub fn add_learned_route(&mut self, key: AddrKey, target: InstanceHandle, now: Instant) {
        target.borrow_mut().incref();
        self.routes.insert(
            key,
            Route::new(
                target,
                RouteSource::Learned,
                Lifetime::Ageable {
                    learned_at: now,
                    ttl: Duration::from_secs(600),
                },
            ),
        );
    }

    pub fn add_iroute(&mut self, network: std::net::Ipv4Addr, netbits: u8, target: InstanceHandle) {
        target.borrow_mut().incref();
        let key = AddrKey::from_ipv4_cidr(network, netbits);
        self.mroute.add_iroute(network, netbits);
        self.routes
            .insert(key, Route::new(target, RouteSource::Iroute, Lifetime::Permanent));
    }

    /// Resolve a destination address to the instance that owns it: an
    /// exact match first (a learned host route or an iroute stored at
    /// the same netbits the caller asked for), then the CIDR
    /// longest-prefix match against every configured iroute length. A
    /// bare host key (netbits 32) only ever satisfies the exact branch
    /// when a `/32` route was learned for it; routing into a `/24`
    /// iroute goes through the longest-prefix branch.
    pub fn route_for(&self, key: &AddrKey, now: Instant) -> Option<&InstanceHandle> {
        let generation = self.mroute.cache_generation();

        if let Some(route) = self.routes.lookup(key) {
            if route.is_valid(now, generation) {
                return Some(&route.target);
            }
        }

        let ip = key.as_ipv4()?;
        let (network, netbits) = self.mroute.lookup(ip)?;
        let cidr_key = AddrKey::from_ipv4_cidr(network, netbits);
        let route = self.routes.lookup(&cidr_key)?;
        if route.is_valid(now, generation) {
            Some(&route.target)
        } else {
            None
        }
    }

    pub fn fire_due_timers(&mut self, now: Instant) -> Vec<ScheduleId> {
        self.schedule.drain_due(now)
    }

    pub fn next_timer_deadline(&mut self) -> Option<Instant> {
        self.schedule.next_deadline()
    }

    /// Walk a bounded slice of the real-address index looking for
    /// instances idle past `idle_timeout`, closing each one found. Each
    /// call advances the scan position so repeated calls eventually cover
    /// the whole table without ever scanning it all at once.
    pub fn run_reaper_pass(&mut self, now: Instant, idle_timeout: Duration) {
        let total_buckets = self.real_index.bucket_count().max(1);
        self.reaper_buckets_per_pass = self
            .reaper_buckets_per_pass
            .clamp(REAPER_MIN_BUCKETS, REAPER_MAX_BUCKETS)
            .min(total_buckets);

        let stale: Vec<InstanceHandle> = self
            .real_index
            .scan_buckets(self.reaper_bucket_base, self.reaper_buckets_per_pass)
            .filter(|(_, handle)| {
                now.duration_since(handle.borrow().last_activity) > idle_timeout
            })
            .map(|(_, handle)| handle.clone())
            .collect();

        self.reaper_bucket_base =
            (self.reaper_bucket_base + self.reaper_buckets_per_pass) % total_buckets;

        for handle in stale {
            self.close_instance(&handle);
        }
    }

    pub fn keepalive(&self) -> &KeepaliveConfig {
        &self.keepalive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip_pool::PoolMode;

    fn test_broker() -> Broker {
        let pool = IfconfigPool::new(
            PoolMode::Tap,
            "10.8.0.0".parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
        )
        .unwrap();
        let keepalive = KeepaliveConfig {
            ping_every: Duration::from_secs(10),
            restart_after: Duration::from_secs(60),
        };
        Broker::new(pool, keepalive, 4)
    }

    #[test]
    fn create_instance_indexes_by_both_addresses() {
        let mut broker = test_broker();
        let now = Instant::now();
        let addr: SocketAddr = "1.2.3.4:5000".parse().unwrap();
        let handle = broker.create_instance(ClientId(1), addr, now).unwrap();

        assert!(broker.lookup_by_real_addr(addr).is_some());
        let virt_key = handle.borrow().virtual_addr_key().unwrap();
        assert!(broker.lookup_by_virtual_addr(&virt_key).is_some());
    }

    #[test]
    fn max_clients_rejects_further_instances() {
        let mut broker = test_broker();
        let now = Instant::now();
        for i in 0..4 {
            let addr: SocketAddr = format!("1.2.3.4:{}", 5000 + i).parse().unwrap();
            broker.create_instance(ClientId(i), addr, now).unwrap();
        }
        let addr: SocketAddr = "1.2.3.4:5999".parse().unwrap();
        assert_eq!(
            broker.create_instance(ClientId(99), addr, now).unwrap_err(),
            ResourceError::MaxClients
        );
    }

    #[test]
    fn close_instance_removes_from_indexes_and_frees_pool() {
        let mut broker = test_broker();
        let now = Instant::now();
        let addr: SocketAddr = "1.2.3.4:5000".parse().unwrap();
        let handle = broker.create_instance(ClientId(1), addr, now).unwrap();

        broker.close_instance(&handle);

        assert!(broker.lookup_by_real_addr(addr).is_none());
        assert!(handle.borrow().is_halted());
    }

    #[test]
    fn closed_instance_routes_become_invalid() {
        let mut broker = test_broker();
        let now = Instant::now();
        let addr: SocketAddr = "1.2.3.4:5000".parse().unwrap();
        let handle = broker.create_instance(ClientId(1), addr, now).unwrap();
        broker.add_iroute("192.168.1.0".parse().unwrap(), 24, handle.clone());

        let key = AddrKey::from_ipv4_cidr("192.168.1.5".parse().unwrap(), 24);
        assert!(broker.route_for(&key, now).is_some());

        broker.close_instance(&handle);
        assert!(broker.route_for(&key, now).is_none());
    }

    #[test]
    fn reaper_closes_idle_instances_without_touching_active_ones() {
        let mut broker = test_broker();
        let old = Instant::now();
        let addr_idle: SocketAddr = "1.2.3.4:5000".parse().unwrap();
        let addr_active: SocketAddr = "1.2.3.5:5000".parse().unwrap();
        broker.create_instance(ClientId(1), addr_idle, old).unwrap();
        let active = broker.create_instance(ClientId(2), addr_active, old).unwrap();

        let later = old + Duration::from_secs(100);
        active.borrow_mut().touch(later);

        broker.run_reaper_pass(later, Duration::from_secs(30));

        assert!(broker.lookup_by_real_addr(addr_idle).is_none());
        assert!(broker.lookup_by_real_addr(addr_active).is_some());
    }

    #[test]
    fn keepalive_ratio_validation() {
        let bad = KeepaliveConfig {
            ping_every: Duration::from_secs(40),
            restart_after: Duration::from_secs(60),
        };
        assert!(bad.validate().is_err());

        let good = KeepaliveConfig {
            ping_every: Duration::from_secs(10),
            restart_after: Duration::from_secs(60),
        };
        assert!(good.validate().is_ok());
    }
}
