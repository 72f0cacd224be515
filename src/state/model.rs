//! Model configuration: bindings, subscriptions and publication.

use crate::config::{MODEL_GROUP_COUNT, MODEL_KEY_COUNT};
use crate::state::{ADDR_UNASSIGNED, KEY_UNUSED};
use std::time::Duration;

/// Position of a model in the device composition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelId {
    /// Vendor (`v`) or SIG (`s`) model
    pub vendor: bool,
    /// Element index
    pub elem_idx: u8,
    /// Model index within the element
    pub mod_idx: u8,
}

impl ModelId {
    /// SIG model at `elem_idx`/`mod_idx`
    pub const fn sig(elem_idx: u8, mod_idx: u8) -> Self {
        Self {
            vendor: false,
            elem_idx,
            mod_idx,
        }
    }

    /// Vendor model at `elem_idx`/`mod_idx`
    pub const fn vendor(elem_idx: u8, mod_idx: u8) -> Self {
        Self {
            vendor: true,
            elem_idx,
            mod_idx,
        }
    }

    /// Packed `elem_idx << 8 | mod_idx` used in storage keys
    pub fn key(self) -> u16 {
        (u16::from(self.elem_idx) << 8) | u16::from(self.mod_idx)
    }

    /// Inverse of [`ModelId::key`]
    pub fn from_key(vendor: bool, key: u16) -> Self {
        let [elem_idx, mod_idx] = key.to_be_bytes();
        Self {
            vendor,
            elem_idx,
            mod_idx,
        }
    }
}

/// Model publication parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelPublication {
    /// Publish address
    pub addr: u16,
    /// AppKey index
    pub key: u16,
    /// Friendship credentials flag
    pub cred: bool,
    /// Publish TTL
    pub ttl: u8,
    /// Retransmit count and interval steps
    pub retransmit: u8,
    /// Steps (bits 0..5) and resolution (bits 6..7)
    pub period: u8,
    /// Fast period divisor (4 bits)
    pub period_div: u8,
    /// Remaining retransmissions; runtime only
    pub count: u8,
}

impl ModelPublication {
    /// Publish period; zero when periodic publishing is off
    pub fn period(&self) -> Duration {
        let steps = u64::from(self.period & 0x3f);
        match self.period >> 6 {
            0 => Duration::from_millis(steps * 100),
            1 => Duration::from_secs(steps),
            2 => Duration::from_secs(steps * 10),
            _ => Duration::from_secs(steps * 10 * 60),
        }
    }

    /// Publication address is assigned
    pub fn is_assigned(&self) -> bool {
        self.addr != ADDR_UNASSIGNED
    }

    /// Reset to the unassigned state
    pub fn clear(&mut self) {
        *self = Self {
            period_div: self.period_div,
            ..Self::default()
        };
    }
}

/// One model of the composition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    /// Position in the composition
    pub id: ModelId,
    /// Bound AppKey indices; [`KEY_UNUSED`] marks a free entry
    pub keys: [u16; MODEL_KEY_COUNT],
    /// Subscribed group addresses; unassigned marks a free entry
    pub groups: [u16; MODEL_GROUP_COUNT],
    /// Publication context, for models that support publishing
    pub publication: Option<ModelPublication>,
    /// Opaque model data has been persisted
    pub data_present: bool,
    pub(crate) bind_pending: bool,
    pub(crate) sub_pending: bool,
    pub(crate) pub_pending: bool,
}

impl Model {
    /// Model without a publication context
    pub fn new(id: ModelId) -> Self {
        Self {
            id,
            keys: [KEY_UNUSED; MODEL_KEY_COUNT],
            groups: [ADDR_UNASSIGNED; MODEL_GROUP_COUNT],
            publication: None,
            data_present: false,
            bind_pending: false,
            sub_pending: false,
            pub_pending: false,
        }
    }

    /// Model with an (unassigned) publication context
    pub fn with_publication(id: ModelId) -> Self {
        Self {
            publication: Some(ModelPublication::default()),
            ..Self::new(id)
        }
    }

    /// Bind `app_idx`, returning false when the binding list is full
    pub fn bind(&mut self, app_idx: u16) -> bool {
        if self.keys.contains(&app_idx) {
            return true;
        }
        match self.keys.iter_mut().find(|key| **key == KEY_UNUSED) {
            Some(slot) => {
                *slot = app_idx;
                true
            }
            None => false,
        }
    }

    /// Subscribe to `group`, returning false when the subscription list is full
    pub fn subscribe(&mut self, group: u16) -> bool {
        if self.groups.contains(&group) {
            return true;
        }
        match self.groups.iter_mut().find(|addr| **addr == ADDR_UNASSIGNED) {
            Some(slot) => {
                *slot = group;
                true
            }
            None => false,
        }
    }

    /// Any attribute is waiting for the next flush
    pub fn has_pending(&self) -> bool {
        self.bind_pending || self.sub_pending || self.pub_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_key_packing() {
        let id = ModelId::vendor(0x02, 0x11);
        assert_eq!(id.key(), 0x0211);
        assert_eq!(ModelId::from_key(true, 0x0211), id);
        assert_eq!(ModelId::from_key(false, 0x0005), ModelId::sig(0, 5));
    }

    #[test]
    fn test_publication_period_resolution() {
        let mut publication = ModelPublication::default();
        assert_eq!(publication.period(), Duration::ZERO);

        publication.period = 0x05;
        assert_eq!(publication.period(), Duration::from_millis(500));
        publication.period = 0x40 | 0x03;
        assert_eq!(publication.period(), Duration::from_secs(3));
        publication.period = 0x80 | 0x02;
        assert_eq!(publication.period(), Duration::from_secs(20));
        publication.period = 0xc0 | 0x01;
        assert_eq!(publication.period(), Duration::from_secs(600));
    }

    #[test]
    fn test_bind_and_subscribe_are_bounded() {
        let mut model = Model::new(ModelId::sig(0, 0));
        for idx in 0..MODEL_KEY_COUNT as u16 {
            assert!(model.bind(idx));
        }
        assert!(model.bind(0));
        assert!(!model.bind(0x100));

        assert!(model.subscribe(0xc000));
        assert!(model.subscribe(0xc000));
        assert_eq!(model.groups.iter().filter(|g| **g != 0).count(), 1);
    }
}
