//! In-memory mesh state mirrored to storage
//!
//! [`MeshState`] is the single owner of every entity the engine persists. The
//! protocol layer and the engine share it through an
//! `Arc<parking_lot::Mutex<MeshState>>`; the engine never keeps a copy.

pub mod keys;
pub mod model;

pub use keys::{AppKey, AppKeyMaterial, Label, Node, ReplayEntry, Subnet};
pub use model::{Model, ModelId, ModelPublication};

use crate::config::{APP_KEY_COUNT, LABEL_COUNT, NODE_COUNT, RPL_COUNT, SUBNET_COUNT};
use crate::table::SlotTable;

/// Unassigned unicast/group address
pub const ADDR_UNASSIGNED: u16 = 0x0000;
/// Key index value marking an unused binding in storage
pub const KEY_UNUSED: u16 = 0xffff;
/// Largest valid 12-bit key index
pub const KEY_INDEX_MAX: u16 = 0x0fff;
/// Largest 24-bit sequence number
pub const SEQ_MAX: u32 = 0x00ff_ffff;

/// Operating role of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// A provisioned node
    Node,
    /// Network infrastructure that provisions other nodes
    Provisioner,
}

impl Role {
    /// Stored byte for this role
    pub fn to_byte(self) -> u8 {
        match self {
            Role::Node => 1,
            Role::Provisioner => 2,
        }
    }

    /// Role for a stored byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Role::Node),
            2 => Some(Role::Provisioner),
            _ => None,
        }
    }
}

/// Primary address and device key assigned at provisioning
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkIdentity {
    /// Unicast address of the primary element
    pub primary_addr: u16,
    /// Device key
    pub dev_key: [u8; 16],
}

impl NetworkIdentity {
    /// True once a primary address has been assigned
    pub fn is_provisioned(&self) -> bool {
        self.primary_addr != ADDR_UNASSIGNED
    }
}

/// IV index and IV update procedure state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IvState {
    /// Current IV index
    pub index: u32,
    /// IV update procedure in progress
    pub update_in_progress: bool,
    /// Hours spent in the current IV update state (7 bits)
    pub duration_hours: u8,
}

/// Heartbeat publication parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatPublication {
    /// Destination; unassigned disables publication
    pub dst: u16,
    /// Remaining count; 0xFFFF publishes indefinitely
    pub count: u16,
    /// Period log
    pub period: u8,
    /// TTL for heartbeat messages
    pub ttl: u8,
    /// Feature bitmap triggering heartbeats
    pub feat: u16,
    /// Network key used for publication
    pub net_idx: u16,
}

impl HeartbeatPublication {
    /// Count value meaning "publish forever"
    pub const COUNT_INDEFINITE: u16 = 0xffff;

    /// Publication is enabled
    pub fn is_enabled(&self) -> bool {
        self.dst != ADDR_UNASSIGNED
    }
}

/// Configuration server state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigState {
    /// Network transmit count and interval steps
    pub net_transmit: u8,
    /// Relay feature state
    pub relay: u8,
    /// Relay retransmit count and interval steps
    pub relay_retransmit: u8,
    /// Secure network beacon state
    pub beacon: u8,
    /// GATT proxy feature state
    pub gatt_proxy: u8,
    /// Friend feature state
    pub frnd: u8,
    /// Default TTL for outgoing messages
    pub default_ttl: u8,
}

impl Default for ConfigState {
    fn default() -> Self {
        Self {
            // 3 transmissions, 20 ms apart
            net_transmit: 0x0a,
            relay: 0x00,
            relay_retransmit: 0x0a,
            beacon: 0x01,
            gatt_proxy: 0x02,
            frnd: 0x02,
            default_ttl: 7,
        }
    }
}

/// All persisted mesh state
#[derive(Debug, Clone)]
pub struct MeshState {
    /// Set once loading committed a provisioned configuration, or on provisioning
    pub valid: bool,
    /// Persisted operating role
    pub role: Option<Role>,
    /// Primary address and device key
    pub identity: NetworkIdentity,
    /// IV index state
    pub iv: IvState,
    /// 24-bit sequence number
    pub seq: u32,
    /// Replay protection list
    pub replay: SlotTable<ReplayEntry, RPL_COUNT>,
    /// Network keys
    pub subnets: SlotTable<Subnet, SUBNET_COUNT>,
    /// Application keys
    pub app_keys: SlotTable<AppKey, APP_KEY_COUNT>,
    /// Heartbeat publication
    pub heartbeat: HeartbeatPublication,
    /// Live configuration server state
    pub cfg: ConfigState,
    /// Device composition, fixed at construction
    pub models: Vec<Model>,
    /// Virtual address labels, addressed by slot
    pub labels: SlotTable<Label, LABEL_COUNT>,
    /// Provisioner's node registry
    pub nodes: SlotTable<Node, NODE_COUNT>,
}

impl MeshState {
    /// Create an unprovisioned state for the given composition
    pub fn new(models: Vec<Model>) -> Self {
        Self {
            valid: false,
            role: None,
            identity: NetworkIdentity::default(),
            iv: IvState::default(),
            seq: 0,
            replay: SlotTable::new("replay"),
            subnets: SlotTable::new("subnet"),
            app_keys: SlotTable::new("app key"),
            heartbeat: HeartbeatPublication::default(),
            cfg: ConfigState::default(),
            models,
            labels: SlotTable::new("label"),
            nodes: SlotTable::new("node"),
        }
    }

    /// Model with the given identity
    pub fn model(&self, id: ModelId) -> Option<&Model> {
        self.models.iter().find(|model| model.id == id)
    }

    /// Mutable model with the given identity
    pub fn model_mut(&mut self, id: ModelId) -> Option<&mut Model> {
        self.models.iter_mut().find(|model| model.id == id)
    }

    /// Forget the provisioning data: address, device key
    pub fn unprovision(&mut self) {
        self.identity = NetworkIdentity::default();
    }

    /// Record the replay state of `src`, flagging it for the next flush.
    ///
    /// Returns the entry so callers can inspect it.
    pub fn update_replay(
        &mut self,
        src: u16,
        seq: u32,
        old_iv: bool,
    ) -> Result<&mut ReplayEntry, crate::error::Exhausted> {
        let entry = self
            .replay
            .find_or_allocate(src, || ReplayEntry::new(src, 0, false))?;
        entry.seq = seq & SEQ_MAX;
        entry.old_iv = old_iv;
        entry.store_pending = true;
        Ok(entry)
    }
}

impl Default for MeshState {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
