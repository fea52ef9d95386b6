//! Multicast/broadcast route cache helper.
//!
//! Grounded on `mroute_helper` in `openvpn/mroute.h`: a small side table
//! that tracks, per netbits length, how many configured `iroute`s use
//! that length, plus a generation counter that invalidates cached
//! per-packet route lookups only when the *set of lengths in use*
//! actually changes (adding a second `/24` iroute doesn't need to bump
//! the generation, only the first one at a new length does).

use crate::addr_key::AddrKey;
use std::net::Ipv4Addr;

pub struct MRoute {
    /// Refcount per prefix length 0..=32 of iroutes installed at that
    /// length. Indexed directly by netbits.
    net_len_refcounts: [u32; 33],
    /// Bumped only on a 0-to-nonzero or nonzero-to-0 transition of a
    /// `net_len_refcounts` bucket, so callers can tell whether their
    /// cached notion of "which prefix lengths exist" is stale.
    cache_generation: u64,
    routes: Vec<(AddrKey, u8)>,
}

impl Default for MRoute {
    fn default() -> Self {
        Self::new()
    }
}

impl MRoute {
    pub fn new() -> Self {
        Self {
            net_len_refcounts: [0; 33],
            cache_generation: 0,
            routes: Vec::new(),
        }
    }

    pub fn cache_generation(&self) -> u64 {
        self.cache_generation
    }

    /// Register an iroute at `netbits`. Bumps the generation iff this is
    /// the first iroute ever installed at that length.
    pub fn add_iroute(&mut self, network: Ipv4Addr, netbits: u8) {
        let netbits = netbits.min(32);
        let count = &mut self.net_len_refcounts[netbits as usize];
        if *count == 0 {
            self.cache_generation += 1;
        }
        *count += 1;

        let key = AddrKey::from_ipv4_cidr(network, netbits);
        self.routes.push((key, netbits));
    }

    /// Remove one iroute at `netbits`. Bumps the generation iff the
    /// refcount for that length drops to zero.
    pub fn del_iroute(&mut self, network: Ipv4Addr, netbits: u8) -> bool {
        let netbits = netbits.min(32);
        let key = AddrKey::from_ipv4_cidr(network, netbits);

        let Some(pos) = self
            .routes
            .iter()
            .position(|(k, n)| *n == netbits && k.equal(&key))
        else {
            return false;
        };
        self.routes.swap_remove(pos);

        let count = &mut self.net_len_refcounts[netbits as usize];
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cache_generation += 1;
        }
        true
    }

    /// Longest-prefix match: search configured lengths from 32 down to 0,
    /// returning the first (most specific) match.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<(Ipv4Addr, u8)> {
        for netbits in (0..=32u8).rev() {
            if self.net_len_refcounts[netbits as usize] == 0 {
                continue;
            }
            let masked = AddrKey::from_ipv4_cidr(addr, netbits);
            if let Some((k, n)) = self.routes.iter().find(|(k, n)| *n == netbits && k.equal(&masked)) {
                return Some((k.as_ipv4().expect("ipv4 key"), *n));
            }
        }
        None
    }

    pub fn lengths_in_use(&self) -> impl Iterator<Item = u8> + '_ {
        self.net_len_refcounts
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(netbits, _)| netbits as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins_over_shorter() {
        let mut m = MRoute::new();
        m.add_iroute(Ipv4Addr::new(10, 0, 0, 0), 8);
        m.add_iroute(Ipv4Addr::new(10, 1, 2, 0), 24);

        let hit = m.lookup(Ipv4Addr::new(10, 1, 2, 5)).unwrap();
        assert_eq!(hit, (Ipv4Addr::new(10, 1, 2, 0), 24));
    }

    #[test]
    fn falls_back_to_shorter_prefix_outside_longer_range() {
        let mut m = MRoute::new();
        m.add_iroute(Ipv4Addr::new(10, 0, 0, 0), 8);
        m.add_iroute(Ipv4Addr::new(10, 1, 2, 0), 24);

        let hit = m.lookup(Ipv4Addr::new(10, 9, 9, 9)).unwrap();
        assert_eq!(hit, (Ipv4Addr::new(10, 0, 0, 0), 8));
    }

    #[test]
    fn generation_only_bumps_on_zero_transition() {
        let mut m = MRoute::new();
        m.add_iroute(Ipv4Addr::new(10, 0, 0, 0), 24);
        let gen_after_first = m.cache_generation();

        m.add_iroute(Ipv4Addr::new(10, 0, 1, 0), 24);
        assert_eq!(m.cache_generation(), gen_after_first);

        m.del_iroute(Ipv4Addr::new(10, 0, 0, 0), 24);
        assert_eq!(m.cache_generation(), gen_after_first);

        m.del_iroute(Ipv4Addr::new(10, 0, 1, 0), 24);
        assert!(m.cache_generation() > gen_after_first);
    }

    #[test]
    fn lookup_misses_when_nothing_configured() {
        let m = MRoute::new();
        assert_eq!(m.lookup(Ipv4Addr::new(1, 2, 3, 4)), None);
    }
}
