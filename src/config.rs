//! Build-time capacities and runtime timing for the settings engine.

use std::time::Duration;

/// Number of subnets (network keys) the node can hold.
pub const SUBNET_COUNT: usize = 4;
/// Number of application keys the node can hold.
pub const APP_KEY_COUNT: usize = 4;
/// Replay protection list size.
pub const RPL_COUNT: usize = 10;
/// Virtual address label slots.
pub const LABEL_COUNT: usize = 4;
/// Provisioned nodes tracked in the provisioner's registry.
pub const NODE_COUNT: usize = 8;
/// Application keys one model can be bound to.
pub const MODEL_KEY_COUNT: usize = 4;
/// Group addresses one model can subscribe to.
pub const MODEL_GROUP_COUNT: usize = 4;
/// Largest opaque model data blob accepted from storage.
pub const MODEL_DATA_MAX: usize = 128;
/// Pending key updates: one per possible app key and subnet.
pub const KEY_UPDATE_COUNT: usize = APP_KEY_COUNT + SUBNET_COUNT;
/// Pending node registry updates.
pub const NODE_UPDATE_COUNT: usize = NODE_COUNT;

/// Minimum hours an IV update state must last before it may change again.
pub const IVU_MIN_HOURS: u8 = 96;
/// Period of the IV update recovery timer.
pub const IVU_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Timing configuration for the flush scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Debounce for generic changes (keys, models, config, sequence, ...)
    pub store_timeout: Duration,
    /// Debounce used when only the replay list is dirty
    pub rpl_store_timeout: Duration,
    /// Short delay for network identity, IV and role changes
    pub flush_debounce: Duration,
    /// Persist the sequence number every `seq_store_rate` messages (0 = always)
    pub seq_store_rate: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(2),
            rpl_store_timeout: Duration::from_secs(5),
            // Gives a disconnecting provisioning link time to close first
            flush_debounce: Duration::from_millis(500),
            seq_store_rate: 128,
        }
    }
}
