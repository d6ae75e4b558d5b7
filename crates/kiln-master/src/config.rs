//! Master configuration.

use serde::{Deserialize, Serialize};

/// Smallest allowed segment (64 KiB). Anything smaller drowns in header
/// and footer overhead.
const SEGMENT_BYTES_MIN: u64 = 64 * 1024;

/// Largest allowed segment (16 MiB): offsets must fit in the 24 bits the
/// index reserves for them inside a 47-bit packed log address.
const SEGMENT_BYTES_MAX: u64 = 16 * 1024 * 1024;

const DEFAULT_SEGMENT_BYTES: u64 = 8 * 1024 * 1024;
const DEFAULT_HASH_TABLE_BUCKETS: u64 = 1024 * 1024;
const DEFAULT_RECOVERY_CHANNELS: usize = 4;
const DEFAULT_REPLICATION_RETRIES: usize = 3;

/// Largest power of two less than or equal to `value` (zero for zero).
#[inline]
fn floor_power_of_two(value: u64) -> u64 {
    if value == 0 {
        0
    } else {
        let shift = 63_u32 - value.leading_zeros();
        1_u64 << shift
    }
}

/// Clamps `value` into `[min, max]` and rounds to the nearest power of two
/// within that range. `min` and `max` must themselves be powers of two.
#[inline]
fn clamp_power_of_two(value: u64, min: u64, max: u64) -> u64 {
    let clamped = value.clamp(min, max);
    if clamped.is_power_of_two() {
        return clamped;
    }

    let lower = floor_power_of_two(clamped).max(min);
    let upper = (lower << 1).min(max).max(min);

    if clamped - lower <= upper.saturating_sub(clamped) {
        lower
    } else {
        upper
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Cluster-unique id of this master; doubles as the log id.
    pub master_id: u64,
    /// Locator other servers use to reach this master.
    pub locator: String,
    /// Locator of the coordinator.
    pub coordinator_locator: String,
    /// Backup servers every fresh log byte is streamed to. Empty disables
    /// replication (single-node development mode).
    pub replica_locators: Vec<String>,
    /// Segment size in bytes; clamped to a power of two in
    /// `[64 KiB, 16 MiB]`.
    pub segment_bytes: u64,
    /// Number of primary buckets (cache lines) in the object index;
    /// clamped to a power of two.
    pub hash_table_buckets: u64,
    /// Concurrent `GetRecoveryData` RPCs during recovery.
    pub recovery_channels: usize,
    /// Admission cap for the master service. The mutating path assumes a
    /// single writer; values above 1 are served behind the state lock.
    pub master_threads: usize,
    /// Attempts per replica before a replication write gives up.
    pub replication_retries: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            master_id: 0,
            locator: "bind:host=master".to_string(),
            coordinator_locator: "bind:host=coordinator".to_string(),
            replica_locators: Vec::new(),
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            hash_table_buckets: DEFAULT_HASH_TABLE_BUCKETS,
            recovery_channels: DEFAULT_RECOVERY_CHANNELS,
            master_threads: 1,
            replication_retries: DEFAULT_REPLICATION_RETRIES,
        }
    }
}

impl MasterConfig {
    /// Returns the configuration with every size snapped to its legal
    /// range. Construction paths call this once so the rest of the system
    /// can rely on the invariants (power-of-two sizes, non-zero counts).
    pub fn normalized(mut self) -> Self {
        self.segment_bytes =
            clamp_power_of_two(self.segment_bytes, SEGMENT_BYTES_MIN, SEGMENT_BYTES_MAX);
        self.hash_table_buckets = clamp_power_of_two(self.hash_table_buckets, 2, 1 << 40);
        self.recovery_channels = self.recovery_channels.max(1);
        self.master_threads = self.master_threads.max(1);
        self.replication_retries = self.replication_retries.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_power_of_two_basics() {
        assert_eq!(floor_power_of_two(0), 0);
        assert_eq!(floor_power_of_two(1), 1);
        assert_eq!(floor_power_of_two(3), 2);
        assert_eq!(floor_power_of_two(1024), 1024);
        assert_eq!(floor_power_of_two(1025), 1024);
    }

    #[test]
    fn clamp_rounds_to_nearest_power() {
        assert_eq!(clamp_power_of_two(96 * 1024, SEGMENT_BYTES_MIN, SEGMENT_BYTES_MAX), 64 * 1024);
        assert_eq!(
            clamp_power_of_two(100 * 1024, SEGMENT_BYTES_MIN, SEGMENT_BYTES_MAX),
            128 * 1024
        );
        assert_eq!(
            clamp_power_of_two(1, SEGMENT_BYTES_MIN, SEGMENT_BYTES_MAX),
            SEGMENT_BYTES_MIN
        );
        assert_eq!(
            clamp_power_of_two(u64::MAX, SEGMENT_BYTES_MIN, SEGMENT_BYTES_MAX),
            SEGMENT_BYTES_MAX
        );
    }

    #[test]
    fn normalized_enforces_bounds() {
        let config = MasterConfig {
            segment_bytes: 1,
            hash_table_buckets: 3,
            recovery_channels: 0,
            master_threads: 0,
            ..MasterConfig::default()
        }
        .normalized();
        assert_eq!(config.segment_bytes, SEGMENT_BYTES_MIN);
        assert_eq!(config.hash_table_buckets, 2);
        assert_eq!(config.recovery_channels, 1);
        assert_eq!(config.master_threads, 1);
    }
}
