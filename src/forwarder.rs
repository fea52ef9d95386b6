//! Packet-path functions: listener-inbound, TUN/TAP-inbound, and
//! broadcast/multicast fan-out.
//!
//! Grounded on the inbound/outbound split in `relay/server/src/server.rs`
//! (`handle_client_input` / `handle_peer_traffic`), generalized from a
//! single-hop relay to the bridging behavior the design doc describes:
//! decrypt off the wire and write to the TUN/TAP device, or read off the
//! TUN/TAP device, look up the destination by learned/iroute/CIDR route,
//! and encrypt onto the wire — with a spoofing check in the first
//! direction and an N-1-copy broadcast fan-out in the second.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

use crate::addr_key::AddrKey;
use crate::broker::{Broker, Command};
use crate::crypto::CryptoContext;
use crate::error::ForwardError;
use crate::instance::InstanceHandle;
use crate::tuntap::DeviceType;

/// Inbound from the wire: decrypt, then either verify (TUN, L3) or learn
/// (TAP, L2) the packet's source address, touch the instance's activity
/// timestamp, and hand the plaintext to the caller to write to the
/// TUN/TAP device.
///
/// TUN carries routed IP traffic: a client can only legitimately source
/// packets from the virtual address it was assigned, so a mismatch is
/// spoofing and the packet is dropped. TAP bridges an Ethernet segment:
/// a client's source MAC isn't tied to its assigned address at all, so
/// instead of comparing, the server learns it — the same way a switch
/// learns which port a MAC lives behind from an incoming frame.
pub fn handle_wire_inbound(
    broker: &mut Broker,
    from: SocketAddr,
    raw: &[u8],
    crypto: &mut dyn CryptoContext,
    device_type: DeviceType,
    now: Instant,
) -> Result<Vec<u8>, ForwardError> {
    let handle = broker
        .lookup_by_real_addr(from)
        .ok_or(ForwardError::BadPacket)?
        .clone();

    if crypto.is_control_packet(raw) {
        crypto.on_timeout_tick();
        return Err(ForwardError::BadPacket);
    }

    let plaintext = crypto.decrypt(raw).map_err(|_| ForwardError::BadPacket)?;

    match device_type {
        DeviceType::Tun => {
            if let Some(source_key) = source_ipv4_key_of(&plaintext) {
                let expected = handle.borrow().virtual_addr_key();
                if let Some(expected) = expected {
                    if !source_key.equal(&expected) {
                        return Err(ForwardError::SourceSpoofed);
                    }
                }
            }
        }
        DeviceType::Tap => {
            if let Some(source_key) = source_mac_key_of(&plaintext) {
                broker.add_learned_route(source_key, handle.clone(), now);
            }
        }
    }

    handle.borrow_mut().touch(now);
    let len = plaintext.len() as u64;
    handle.borrow_mut().record_in(len);

    Ok(plaintext)
}

/// Inbound from the TUN/TAP device: route by destination address (learned
/// route, static iroute, or broadcast/multicast), encrypt per-destination,
/// and queue a [`Command::SendTo`] for each recipient. `exclude`, when
/// set, skips that real address in a broadcast/multicast fan-out — used
/// when this frame is itself a peer's decrypted broadcast being
/// re-presented for client-to-client relay, so the sender never gets its
/// own packet echoed back. A genuinely host-originated frame (read off
/// the device with no peer sender) passes `None`.
pub fn handle_tun_inbound(
    broker: &mut Broker,
    frame: &[u8],
    crypto_by_instance: &mut dyn FnMut(&InstanceHandle) -> Box<dyn CryptoContext>,
    device_type: DeviceType,
    exclude: Option<SocketAddr>,
    now: Instant,
) -> Vec<Command> {
    let Some(dest_key) = dest_key_of(frame, device_type) else {
        return Vec::new();
    };

    if dest_key.is_broadcast_mac() || dest_key.is_multicast_mac() || dest_key.is_multicast_ipv4() {
        return broadcast_to_all(&*broker, frame, crypto_by_instance, exclude);
    }

    let Some(target) = broker.route_for(&dest_key, now).cloned() else {
        return Vec::new();
    };

    let Some(real_addr) = target.borrow().real_addr else {
        return Vec::new();
    };
    if Some(real_addr) == exclude {
        return Vec::new();
    }

    let mut crypto = crypto_by_instance(&target);
    let payload = crypto.encrypt(frame);
    target.borrow_mut().record_out(frame.len() as u64);

    vec![Command::SendTo {
        to: real_addr,
        payload,
    }]
}

/// Re-present a peer's already-decrypted broadcast/multicast frame to
/// the rest of the mesh, skipping `from`'s own real address. Unlike
/// [`handle_tun_inbound`] this never attempts unicast routing — a plain
/// routed packet reaches its peer by being written to the TUN/TAP device
/// and read back from it, the same as real IP-forwarding would do, so
/// this is only ever called for the broadcast/multicast case, where a
/// device read-back never happens: each peer still needs a direct copy.
pub fn relay_broadcast_to_peers(
    broker: &mut Broker,
    frame: &[u8],
    crypto_by_instance: &mut dyn FnMut(&InstanceHandle) -> Box<dyn CryptoContext>,
    device_type: DeviceType,
    from: SocketAddr,
) -> Vec<Command> {
    let Some(dest_key) = dest_key_of(frame, device_type) else {
        return Vec::new();
    };
    if !(dest_key.is_broadcast_mac() || dest_key.is_multicast_mac() || dest_key.is_multicast_ipv4()) {
        return Vec::new();
    }
    broadcast_to_all(&*broker, frame, crypto_by_instance, Some(from))
}

/// Fan a frame out to every instance except `exclude` (the originator,
/// when this broadcast came from a peer rather than the host). Per-
/// recipient encryption failures or backpressure only drop that
/// recipient's copy.
fn broadcast_to_all(
    broker: &Broker,
    frame: &[u8],
    crypto_by_instance: &mut dyn FnMut(&InstanceHandle) -> Box<dyn CryptoContext>,
    exclude: Option<SocketAddr>,
) -> Vec<Command> {
    let mut commands = Vec::new();
    for (_, handle) in broker_real_addrs(broker) {
        if handle.borrow().is_halted() {
            continue;
        }
        let Some(real_addr) = handle.borrow().real_addr else {
            continue;
        };
        if Some(real_addr) == exclude {
            continue;
        }
        let mut crypto = crypto_by_instance(&handle);
        let payload = crypto.encrypt(frame);
        commands.push(Command::SendTo {
            to: real_addr,
            payload,
        });
    }
    commands
}

fn broker_real_addrs(broker: &Broker) -> Vec<(AddrKey, InstanceHandle)> {
    broker
        .iter_real_index()
        .map(|(k, v)| (*k, v.clone()))
        .collect()
}

/// TAP: first 6 bytes of an Ethernet-framed payload are the destination
/// MAC. TUN: no L2 header at all, so the destination is the IPv4 header's
/// destination address at bytes 16..20.
fn dest_key_of(frame: &[u8], device_type: DeviceType) -> Option<AddrKey> {
    match device_type {
        DeviceType::Tap => {
            if frame.len() < 6 {
                return None;
            }
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&frame[0..6]);
            Some(AddrKey::from_mac(mac))
        }
        DeviceType::Tun => dest_ipv4_key_of(frame),
    }
}

/// Source MAC lives at bytes 6..12 of an Ethernet frame.
fn source_mac_key_of(frame: &[u8]) -> Option<AddrKey> {
    if frame.len() < 12 {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&frame[6..12]);
    Some(AddrKey::from_mac(mac))
}

/// IPv4 header source address, bytes 12..16. IPv6 isn't handled; mandatory
/// IPv6 support is a Non-goal.
fn source_ipv4_key_of(frame: &[u8]) -> Option<AddrKey> {
    if frame.len() < 20 || (frame[0] >> 4) != 4 {
        return None;
    }
    let ip = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
    Some(AddrKey::from_ipv4(ip, None))
}

/// IPv4 header destination address, bytes 16..20.
fn dest_ipv4_key_of(frame: &[u8]) -> Option<AddrKey> {
    if frame.len() < 20 || (frame[0] >> 4) != 4 {
        return None;
    }
    let ip = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);
    Some(AddrKey::from_ipv4(ip, None))
}
