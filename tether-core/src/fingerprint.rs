//! Fingerprints identifying one reliable send.
//!
//! A fingerprint is the first eight bytes of a BLAKE3 hash over the
//! wall-clock nanosecond timestamp and a per-source counter. Collisions
//! are possible in principle and ignored by the protocol.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Opaque identifier matching an acknowledgement to its reliable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Produces fresh fingerprints for one connection.
#[derive(Debug, Default)]
pub struct FingerprintSource {
    counter: u64,
    last: Option<Fingerprint>,
}

impl FingerprintSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the next fingerprint. Never equal to the previous one.
    pub fn next_fingerprint(&mut self) -> Fingerprint {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();

        loop {
            self.counter = self.counter.wrapping_add(1);

            let mut hasher = blake3::Hasher::new();
            hasher.update(&nanos.to_le_bytes());
            hasher.update(&self.counter.to_le_bytes());
            let hash = hasher.finalize();

            let mut raw = [0u8; 8];
            raw.copy_from_slice(&hash.as_bytes()[..8]);
            let fingerprint = Fingerprint(u64::from_le_bytes(raw));

            if self.last != Some(fingerprint) {
                self.last = Some(fingerprint);
                return fingerprint;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn consecutive_fingerprints_differ() {
        let mut source = FingerprintSource::new();
        let a = source.next_fingerprint();
        let b = source.next_fingerprint();
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprints_are_effectively_unique() {
        let mut source = FingerprintSource::new();
        let seen: HashSet<_> = (0..10_000).map(|_| source.next_fingerprint()).collect();
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn display_is_fixed_width_hex() {
        assert_eq!(Fingerprint::from_raw(0xab).to_string(), "00000000000000ab");
    }

    #[test]
    fn serializes_as_bare_number() {
        let json = serde_json::to_string(&Fingerprint::from_raw(42)).unwrap();
        assert_eq!(json, "42");
    }
}
