//! Per-client instance lifecycle.
//!
//! Grounded on `multi_instance` in `openvpn/multi.h`: one struct per
//! connected peer, reference-counted because it's reachable both from the
//! address indexes (by real address, by virtual address) and from any
//! route that targets it. Single-threaded, so `Rc<RefCell<..>>` is the
//! idiomatic choice rather than `Arc<Mutex<..>>` — there is exactly one
//! core thread and it never hands an `Instance` to another one.

use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Instant;

use crate::addr_key::AddrKey;
use crate::schedule::ScheduleId;

pub type InstanceHandle = Rc<RefCell<Instance>>;

/// Stable identity across reconnects, standing in for the TLS layer's
/// common-name/peer-info since that layer is out of scope here. Opaque
/// on purpose: nothing in this crate inspects its bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl ClientId {
    pub const ZERO: ClientId = ClientId(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Accepted, virtual address assignment and crypto handshake pending.
    Connecting,
    Established,
    /// Marked for teardown; still reachable via old routes until reaped.
    Halting,
}

pub struct Instance {
    pub client_id: ClientId,
    pub state: InstanceState,
    pub real_addr: Option<SocketAddr>,
    pub virtual_addr: Option<IpAddr>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// At most one live schedule entry per instance (its keepalive/reap
    /// timer); re-arming replaces this id rather than inserting another.
    pub schedule_id: Option<ScheduleId>,
    /// Explicit refcount distinct from `Rc::strong_count`: it counts
    /// logical references the broker intends to hold (real index, virtual
    /// index, pending routes) so lifecycle tests can assert it independently
    /// of how many `Rc` clones happen to be alive in a given code path.
    refcount: u32,
}

impl Instance {
    pub fn new(client_id: ClientId, real_addr: SocketAddr, now: Instant) -> Self {
        Self {
            client_id,
            state: InstanceState::Connecting,
            real_addr: Some(real_addr),
            virtual_addr: None,
            created_at: now,
            last_activity: now,
            bytes_in: 0,
            bytes_out: 0,
            schedule_id: None,
            refcount: 0,
        }
    }

    #[cfg(test)]
    pub fn new_test(client_id: ClientId) -> Self {
        Self::new(
            client_id,
            "127.0.0.1:1".parse().unwrap(),
            Instant::now(),
        )
    }

    pub fn real_addr_key(&self) -> Option<AddrKey> {
        self.real_addr
            .map(|a| AddrKey::from_socket_addr(a, true))
    }

    pub fn virtual_addr_key(&self) -> Option<AddrKey> {
        match self.virtual_addr? {
            IpAddr::V4(ip) => Some(AddrKey::from_ipv4(ip, None)),
            IpAddr::V6(ip) => Some(AddrKey::from_ipv6(ip, None)),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.state == InstanceState::Halting
    }

    pub fn mark_halted(&mut self) {
        self.state = InstanceState::Halting;
    }

    pub fn mark_established(&mut self, virtual_addr: IpAddr) {
        self.state = InstanceState::Established;
        self.virtual_addr = Some(virtual_addr);
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn record_in(&mut self, bytes: u64) {
        self.bytes_in += bytes;
    }

    pub fn record_out(&mut self, bytes: u64) {
        self.bytes_out += bytes;
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn incref(&mut self) {
        self.refcount += 1;
    }

    pub fn decref(&mut self) {
        self.refcount = self.refcount.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instance_starts_connecting_with_no_virtual_addr() {
        let inst = Instance::new_test(ClientId(1));
        assert_eq!(inst.state, InstanceState::Connecting);
        assert!(inst.virtual_addr.is_none());
    }

    #[test]
    fn mark_established_sets_virtual_addr() {
        let mut inst = Instance::new_test(ClientId(1));
        let addr: IpAddr = "10.8.0.2".parse().unwrap();
        inst.mark_established(addr);
        assert_eq!(inst.state, InstanceState::Established);
        assert_eq!(inst.virtual_addr, Some(addr));
    }

    #[test]
    fn refcount_tracks_incref_decref() {
        let mut inst = Instance::new_test(ClientId(1));
        inst.incref();
        inst.incref();
        inst.decref();
        assert_eq!(inst.refcount(), 1);
    }

    #[test]
    fn decref_below_zero_saturates() {
        let mut inst = Instance::new_test(ClientId(1));
        inst.decref();
        assert_eq!(inst.refcount(), 0);
    }
}
