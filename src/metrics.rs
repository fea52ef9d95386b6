//! Process-wide metrics.
//!
//! Grounded on `relay/server/src/server.rs`'s use of `opentelemetry`
//! counters (`allocations_up_down_counter`, `data_relayed_counter`):
//! instances and bytes relayed are exactly analogous to that relay's
//! allocations and relayed data, just for a bridging daemon instead of a
//! TURN relay.

use opentelemetry::metrics::{Counter, UpDownCounter};
use opentelemetry::{global, KeyValue};

pub struct Metrics {
    pub instances: UpDownCounter<i64>,
    pub bytes_relayed: Counter<u64>,
    pub packets_dropped: Counter<u64>,
    pub pool_exhausted: Counter<u64>,
}

impl Metrics {
    pub fn new() -> Self {
        let meter = global::meter("vpn-multi");
        Self {
            instances: meter
                .i64_up_down_counter("vpn_multi_instances")
                .with_description("Number of currently connected peer instances")
                .build(),
            bytes_relayed: meter
                .u64_counter("vpn_multi_bytes_relayed")
                .with_description("Total bytes bridged between peers and the TUN/TAP device")
                .build(),
            packets_dropped: meter
                .u64_counter("vpn_multi_packets_dropped")
                .with_description("Packets dropped due to backpressure or a rejected route")
                .build(),
            pool_exhausted: meter
                .u64_counter("vpn_multi_pool_exhausted_total")
                .with_description("Times a new instance was rejected for lack of a free virtual address")
                .build(),
        }
    }

    pub fn instance_created(&self) {
        self.instances.add(1, &[]);
    }

    pub fn instance_closed(&self) {
        self.instances.add(-1, &[]);
    }

    pub fn relayed(&self, bytes: u64, direction: &'static str) {
        self.bytes_relayed.add(bytes, &[KeyValue::new("direction", direction)]);
    }

    pub fn dropped(&self, reason: &'static str) {
        self.packets_dropped.add(1, &[KeyValue::new("reason", reason)]);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
