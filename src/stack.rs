//! Hooks into the mesh protocol layer
//!
//! The engine restores state but does not run the protocol. Everything that
//! needs key derivation, timers or the radio goes through [`MeshStack`]. All
//! hooks have no-op defaults except [`MeshStack::app_id`].

use crate::state::{ModelId, Subnet};
use std::time::Duration;

/// Protocol layer callbacks used while loading and committing
///
/// Hooks are called without the state lock held.
pub trait MeshStack: Send + Sync {
    /// Derive the application identifier (AID) of an application key
    fn app_id(&self, key: &[u8; 16]) -> u8;

    /// Derive network credentials and beacon data for a restored subnet
    fn init_subnet(&self, _subnet: &Subnet) -> Result<(), String> {
        Ok(())
    }

    /// Stop advertising the provisioning service
    fn disable_provisioning_proxy(&self) {}

    /// Arm the IV update recovery timer
    fn start_iv_recovery(&self, _after: Duration) {}

    /// Start periodic publication of a restored model
    fn start_publication(&self, _model: ModelId, _period: Duration) {}

    /// Start heartbeat publication
    fn start_heartbeat(&self) {}

    /// Bring the network layer up
    fn start_network(&self) {}

    /// Hand opaque model data back to the model that stored it
    fn restore_model_data(&self, _model: ModelId, _data: &[u8]) -> Result<(), String> {
        Ok(())
    }

    /// Model-level commit, once the whole configuration is loaded
    fn commit_model(&self, _model: ModelId) {}
}
