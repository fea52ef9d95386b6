//! TUN/TAP device capability surface.
//!
//! The platform syscalls themselves are out of scope (per the design
//! doc's Non-goals); what's in scope is the trait boundary the event
//! loop and forwarder hold instead, matching the "the core holds only
//! the trait object" pattern used for [`crate::crypto::CryptoContext`].
//! [`NullDevice`] is an in-memory loopback implementation used by tests.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Tun,
    Tap,
}

pub trait TunTap {
    fn device_type(&self) -> DeviceType;
    fn mtu(&self) -> usize;

    /// Non-blocking read of one frame, if any is queued.
    fn try_read(&mut self) -> Option<Vec<u8>>;

    fn write(&mut self, frame: &[u8]) -> std::io::Result<()>;

    fn close(&mut self);
}

/// Loopback device for tests: whatever is written comes back out of
/// `try_read` untouched, letting the forwarder/event-loop tests exercise
/// both directions without a real platform device.
pub struct NullDevice {
    device_type: DeviceType,
    mtu: usize,
    inbound: VecDeque<Vec<u8>>,
    closed: bool,
}

impl NullDevice {
    pub fn new(device_type: DeviceType, mtu: usize) -> Self {
        Self {
            device_type,
            mtu,
            inbound: VecDeque::new(),
            closed: false,
        }
    }

    /// Queue a frame as if it had arrived from the kernel, for tests that
    /// exercise the TUN/TAP-inbound forwarding path.
    pub fn inject(&mut self, frame: Vec<u8>) {
        self.inbound.push_back(frame);
    }
}

impl TunTap for NullDevice {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn try_read(&mut self) -> Option<Vec<u8>> {
        if self.closed {
            return None;
        }
        self.inbound.pop_front()
    }

    fn write(&mut self, frame: &[u8]) -> std::io::Result<()> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "device closed",
            ));
        }
        self.inbound.push_back(frame.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
