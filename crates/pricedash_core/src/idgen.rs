//! Compact time-ordered identifiers.
//!
//! Layout of the 6-byte id:
//!
//! ```text
//! [0..4]  seconds since 2000-01-01T00:00:00Z, big-endian
//! [4]     per-generator counter, wrapping
//! [5]     random byte
//! ```

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicU8, Ordering};
use uuid::Uuid;

/// Unix time of 2000-01-01T00:00:00Z.
pub const EPOCH_2000_SECS: i64 = 946_684_800;
pub const ID_LEN: usize = 6;

#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: AtomicU8,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&self) -> [u8; ID_LEN] {
        self.generate_at(Utc::now())
    }

    /// Lowercase hex of `generate()`, 12 characters.
    pub fn generate_hex(&self) -> String {
        to_hex(&self.generate())
    }

    /// Builds an id for `now`; timestamps outside the u32 range saturate.
    pub fn generate_at(&self, now: DateTime<Utc>) -> [u8; ID_LEN] {
        let seconds = (now.timestamp() - EPOCH_2000_SECS).clamp(0, i64::from(u32::MAX));
        let seconds = u32::try_from(seconds).unwrap_or(u32::MAX);
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let random = Uuid::new_v4().as_bytes()[0];

        let mut id = [0u8; ID_LEN];
        id[..4].copy_from_slice(&seconds.to_be_bytes());
        id[4] = counter;
        id[5] = random;
        id
    }
}

/// Creation time encoded in an id, at second precision.
pub fn timestamp_of(id: &[u8; ID_LEN]) -> Option<DateTime<Utc>> {
    let seconds = u32::from_be_bytes([id[0], id[1], id[2], id[3]]);
    Utc.timestamp_opt(EPOCH_2000_SECS + i64::from(seconds), 0)
        .single()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
