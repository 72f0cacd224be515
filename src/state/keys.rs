//! Keyed entities: subnets, application keys, replay entries, labels, nodes.

use crate::table::Slotted;

/// Key refresh phase of a subnet
pub mod kr_phase {
    /// Normal operation
    pub const NORMAL: u8 = 0x00;
    /// New key distributed, old key still in use
    pub const PHASE_1: u8 = 0x01;
    /// New key in use for transmission
    pub const PHASE_2: u8 = 0x02;
}

/// Network key entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    /// 12-bit NetKey index
    pub net_idx: u16,
    /// Key refresh flag
    pub kr_flag: bool,
    /// Key refresh phase (7 bits)
    pub kr_phase: u8,
    /// Old and new key material
    pub keys: [[u8; 16]; 2],
}

impl Subnet {
    /// Subnet in normal phase with a single key
    pub fn new(net_idx: u16, key: [u8; 16]) -> Self {
        Self {
            net_idx,
            kr_flag: false,
            kr_phase: kr_phase::NORMAL,
            keys: [key, [0; 16]],
        }
    }
}

impl Slotted for Subnet {
    type Id = u16;

    fn id(&self) -> u16 {
        self.net_idx
    }
}

/// Application key material and its derived AID
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppKeyMaterial {
    /// Key value
    pub val: [u8; 16],
    /// Derived application identifier; recomputed at commit, never stored
    pub id: u8,
}

/// Application key entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppKey {
    /// 12-bit AppKey index
    pub app_idx: u16,
    /// Bound network key
    pub net_idx: u16,
    /// Second key slot holds an updated key
    pub updated: bool,
    /// Current and updated key material
    pub keys: [AppKeyMaterial; 2],
}

impl AppKey {
    /// Application key bound to `net_idx` with a single key
    pub fn new(app_idx: u16, net_idx: u16, key: [u8; 16]) -> Self {
        Self {
            app_idx,
            net_idx,
            updated: false,
            keys: [
                AppKeyMaterial { val: key, id: 0 },
                AppKeyMaterial::default(),
            ],
        }
    }
}

impl Slotted for AppKey {
    type Id = u16;

    fn id(&self) -> u16 {
        self.app_idx
    }
}

/// Replay protection entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayEntry {
    /// Source address; never zero for an occupied slot
    pub src: u16,
    /// Last seen 24-bit sequence number
    pub seq: u32,
    /// Sequence was received in the previous IV index
    pub old_iv: bool,
    /// Entry changed since the last flush
    pub store_pending: bool,
}

impl ReplayEntry {
    /// Entry with no store pending
    pub fn new(src: u16, seq: u32, old_iv: bool) -> Self {
        Self {
            src,
            seq,
            old_iv,
            store_pending: false,
        }
    }
}

impl Slotted for ReplayEntry {
    type Id = u16;

    fn id(&self) -> u16 {
        self.src
    }
}

/// Virtual address label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label {
    /// Reference count; zero means the label is deleted
    pub ref_count: u16,
    /// Virtual address hashed from the UUID
    pub addr: u16,
    /// Label UUID
    pub uuid: [u8; 16],
    /// Changed since the last flush
    pub changed: bool,
}

impl Label {
    /// Label with a single reference
    pub fn new(addr: u16, uuid: [u8; 16]) -> Self {
        Self {
            ref_count: 1,
            addr,
            uuid,
            changed: false,
        }
    }

    /// A label with no references is logically deleted
    pub fn is_deleted(&self) -> bool {
        self.ref_count == 0
    }
}

/// Node in the provisioner's registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    /// Primary unicast address
    pub addr: u16,
    /// Primary NetKey index of the node
    pub net_idx: u16,
    /// Number of elements
    pub num_elem: u8,
    /// Device key of the node
    pub dev_key: [u8; 16],
}

impl Slotted for Node {
    type Id = u16;

    fn id(&self) -> u16 {
        self.addr
    }
}
