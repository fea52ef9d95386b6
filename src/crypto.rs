//! Crypto/TLS hook surface.
//!
//! The design doc is explicit that the key-exchange state machine and
//! symmetric codecs are out of scope; what's in scope is the seam they
//! plug into. `CryptoContext` is that seam, one instance per peer, held
//! by the core only as a trait object — matching the capability-trait
//! pattern the design notes call for. [`NullCrypto`] is a trivial
//! XOR-based stand-in so the forwarder's tests can exercise the full
//! encrypt/decrypt path without a real crypto dependency.

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("packet failed authentication/decryption")]
    Reject,
    #[error("control channel message outside an established session")]
    UnexpectedControl,
}

pub trait CryptoContext {
    /// True if this packet belongs to the control channel (key exchange,
    /// rekey) rather than carrying tunneled data.
    fn is_control_packet(&self, raw: &[u8]) -> bool;

    fn decrypt(&mut self, raw: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8>;

    /// Called on every scheduler tick for this peer; a real implementation
    /// uses this to nudge a rekey. The null implementation does nothing.
    fn on_timeout_tick(&mut self) {}
}

/// XOR "cipher" with a single-byte key, purely for tests. Not secure, not
/// meant to be: the actual crypto layer lives outside this crate.
pub struct NullCrypto {
    key: u8,
}

impl NullCrypto {
    pub fn new(key: u8) -> Self {
        Self { key }
    }
}

impl CryptoContext for NullCrypto {
    fn is_control_packet(&self, raw: &[u8]) -> bool {
        raw.first() == Some(&0xFF)
    }

    fn decrypt(&mut self, raw: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if raw.is_empty() {
            return Err(CryptoError::Reject);
        }
        Ok(raw.iter().map(|b| b ^ self.key).collect())
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        plaintext.iter().map(|b| b ^ self.key).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let mut crypto = NullCrypto::new(0x42);
        let plaintext = b"hello".to_vec();
        let ciphertext = crypto.encrypt(&plaintext);
        assert_ne!(ciphertext, plaintext);
        assert_eq!(crypto.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn empty_packet_rejected() {
        let mut crypto = NullCrypto::new(0x42);
        assert_eq!(crypto.decrypt(&[]), Err(CryptoError::Reject));
    }

    #[test]
    fn control_packet_marker_detected() {
        let crypto = NullCrypto::new(0x42);
        assert!(crypto.is_control_packet(&[0xFF, 0x01]));
        assert!(!crypto.is_control_packet(&[0x01, 0xFF]));
    }
}
