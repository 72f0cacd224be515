//! Record codec
//!
//! Maps mesh entities to storage keys and fixed-layout values, and applies
//! persisted records back onto a [`MeshState`].
//!
//! Keys follow `<category>[/<hex-index>][/<attribute>]`:
//!
//! - Singletons: `Net`, `IV`, `Seq`, `HBPub`, `Cfg`, `Role`
//! - Sparse entities: `RPL/<src>`, `NetKey/<idx>`, `AppKey/<idx>`, `Va/<slot>`, `Node/<addr>`
//! - Model attributes: `s/<key>/<attr>` or `v/<key>/<attr>`, where `key` is
//!   `elem_idx << 8 | mod_idx` and `attr` is one of `bind`, `sub`, `pub`, `data`
//!
//! Indices are lowercase hex without padding. Keys are parsed into a
//! [`RecordKey`] before any value is looked at, so dispatch is a `match` on the
//! category and then on the attribute.

pub mod records;

use crate::config::MODEL_DATA_MAX;
use crate::error::DecodeError;
use crate::state::{
    ConfigState, Label, MeshState, ModelId, ReplayEntry, ADDR_UNASSIGNED, KEY_UNUSED,
};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Per-model persisted attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelAttr {
    /// Bound AppKey indices
    Bind,
    /// Subscribed group addresses
    Sub,
    /// Publication parameters
    Pub,
    /// Opaque model-defined data
    Data,
}

impl ModelAttr {
    fn as_str(self) -> &'static str {
        match self {
            ModelAttr::Bind => "bind",
            ModelAttr::Sub => "sub",
            ModelAttr::Pub => "pub",
            ModelAttr::Data => "data",
        }
    }
}

/// A parsed storage key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// `Net`
    Net,
    /// `IV`
    Iv,
    /// `Seq`
    Seq,
    /// `RPL/<src>`
    Rpl(u16),
    /// `NetKey/<net_idx>`
    NetKey(u16),
    /// `AppKey/<app_idx>`
    AppKey(u16),
    /// `HBPub`
    HbPub,
    /// `Cfg`
    Cfg,
    /// `s/<key>/<attr>` or `v/<key>/<attr>`
    Model {
        /// Model position
        id: ModelId,
        /// Attribute
        attr: ModelAttr,
    },
    /// `Role`
    Role,
    /// `Va/<slot>`
    Label(u16),
    /// `Node/<addr>`
    Node(u16),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Net => f.write_str("Net"),
            RecordKey::Iv => f.write_str("IV"),
            RecordKey::Seq => f.write_str("Seq"),
            RecordKey::Rpl(src) => write!(f, "RPL/{src:x}"),
            RecordKey::NetKey(idx) => write!(f, "NetKey/{idx:x}"),
            RecordKey::AppKey(idx) => write!(f, "AppKey/{idx:x}"),
            RecordKey::HbPub => f.write_str("HBPub"),
            RecordKey::Cfg => f.write_str("Cfg"),
            RecordKey::Model { id, attr } => {
                let prefix = if id.vendor { "v" } else { "s" };
                write!(f, "{prefix}/{:x}/{}", id.key(), attr.as_str())
            }
            RecordKey::Role => f.write_str("Role"),
            RecordKey::Label(slot) => write!(f, "Va/{slot:x}"),
            RecordKey::Node(addr) => write!(f, "Node/{addr:x}"),
        }
    }
}

fn parse_index(key: &str, token: Option<&str>) -> Result<u16, DecodeError> {
    let token = token.ok_or_else(|| DecodeError::MalformedKey(key.to_string()))?;
    if token.is_empty() || !token.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return Err(DecodeError::MalformedKey(key.to_string()));
    }
    u16::from_str_radix(token, 16).map_err(|_| DecodeError::MalformedKey(key.to_string()))
}

impl FromStr for RecordKey {
    type Err = DecodeError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let mut parts = key.split('/');
        let category = parts.next().unwrap_or_default();

        let parsed = match category {
            "Net" => RecordKey::Net,
            "IV" => RecordKey::Iv,
            "Seq" => RecordKey::Seq,
            "HBPub" => RecordKey::HbPub,
            "Cfg" => RecordKey::Cfg,
            "Role" => RecordKey::Role,
            "RPL" => RecordKey::Rpl(parse_index(key, parts.next())?),
            "NetKey" => RecordKey::NetKey(parse_index(key, parts.next())?),
            "AppKey" => RecordKey::AppKey(parse_index(key, parts.next())?),
            "Va" => RecordKey::Label(parse_index(key, parts.next())?),
            "Node" => RecordKey::Node(parse_index(key, parts.next())?),
            "s" | "v" => {
                let mod_key = parse_index(key, parts.next())?;
                let attr = match parts.next() {
                    Some("bind") => ModelAttr::Bind,
                    Some("sub") => ModelAttr::Sub,
                    Some("pub") => ModelAttr::Pub,
                    Some("data") => ModelAttr::Data,
                    Some(_) => return Err(DecodeError::UnknownAttribute(key.to_string())),
                    None => return Err(DecodeError::MalformedKey(key.to_string())),
                };
                RecordKey::Model {
                    id: ModelId::from_key(category == "v", mod_key),
                    attr,
                }
            }
            _ => return Err(DecodeError::UnknownCategory(key.to_string())),
        };

        // Trailing components are not part of any key
        if parts.next().is_some() {
            return Err(DecodeError::MalformedKey(key.to_string()));
        }
        Ok(parsed)
    }
}

/// What the loader is restoring into
pub struct Restore<'a> {
    /// Live mesh state
    pub state: &'a mut MeshState,
    /// Configuration read from storage, applied only at commit
    pub stored_cfg: &'a mut Option<ConfigState>,
    /// Sequence store rate used to round the restored sequence number up
    pub seq_store_rate: u32,
}

/// Result of applying one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The record was folded into the state
    State,
    /// Opaque model data; the caller hands the value to the model's codec
    ModelData(ModelId),
}

/// Sequence number to resume from after reading `stored`
///
/// Rounds up to the next store-rate boundary and steps back one, so the very
/// next transmission lands on a boundary and triggers a store.
pub fn resume_seq(stored: u32, store_rate: u32) -> u32 {
    if store_rate == 0 {
        return stored;
    }
    stored + (store_rate - stored % store_rate) - 1
}

/// Apply one persisted record
///
/// An empty value deletes or resets the entity. A non-empty value must match
/// the record's exact length.
pub fn apply(
    target: &mut Restore<'_>,
    key: &RecordKey,
    value: &[u8],
) -> Result<Applied, DecodeError> {
    let state = &mut *target.state;

    match *key {
        RecordKey::Net => {
            if value.is_empty() {
                state.unprovision();
                debug!("cleared network identity");
            } else {
                state.identity = records::decode_net(key, value)?;
                debug!(addr = state.identity.primary_addr, "provisioned with primary address");
            }
        }
        RecordKey::Iv => {
            if value.is_empty() {
                state.iv.index = 0;
                state.iv.update_in_progress = false;
            } else {
                state.iv = records::decode_iv(key, value)?;
                debug!(
                    iv_index = state.iv.index,
                    update = state.iv.update_in_progress,
                    duration = state.iv.duration_hours,
                    "restored IV index"
                );
            }
        }
        RecordKey::Seq => {
            state.seq = if value.is_empty() {
                0
            } else {
                resume_seq(records::decode_seq(key, value)?, target.seq_store_rate)
            };
            debug!(seq = state.seq, "restored sequence number");
        }
        RecordKey::Rpl(src) => {
            if value.is_empty() {
                if state.replay.remove(src).is_none() {
                    warn!(src, "unable to find replay entry to delete");
                }
                return Ok(Applied::State);
            }
            if src == ADDR_UNASSIGNED {
                return Err(DecodeError::Invalid {
                    key: key.to_string(),
                    reason: "unassigned source address",
                });
            }
            let (seq, old_iv) = records::decode_rpl(key, value)?;
            let entry = state
                .replay
                .find_or_allocate(src, || ReplayEntry::new(src, 0, false))
                .map_err(|err| DecodeError::Exhausted(err.table))?;
            entry.seq = seq;
            entry.old_iv = old_iv;
            debug!(src, seq, old_iv, "restored replay entry");
        }
        RecordKey::NetKey(net_idx) => {
            if value.is_empty() {
                match state.subnets.remove(net_idx) {
                    Some(_) => debug!(net_idx, "deleted network key"),
                    None => debug!(net_idx, "no subnet to delete"),
                }
                return Ok(Applied::State);
            }
            let subnet = records::decode_net_key(key, net_idx, value)?;
            let slot = state
                .subnets
                .find_or_allocate(net_idx, || subnet)
                .map_err(|err| DecodeError::Exhausted(err.table))?;
            *slot = subnet;
            debug!(net_idx, "network key recovered from storage");
        }
        RecordKey::AppKey(app_idx) => {
            if value.is_empty() {
                if state.app_keys.remove(app_idx).is_some() {
                    debug!(app_idx, "deleted application key");
                }
                return Ok(Applied::State);
            }
            let app_key = records::decode_app_key(key, app_idx, value)?;
            let slot = state
                .app_keys
                .find_or_allocate(app_idx, || app_key)
                .map_err(|err| DecodeError::Exhausted(err.table))?;
            *slot = app_key;
            debug!(app_idx, "application key recovered from storage");
        }
        RecordKey::HbPub => {
            if value.is_empty() {
                state.heartbeat = Default::default();
                debug!("cleared heartbeat publication");
            } else {
                state.heartbeat = records::decode_hb_pub(key, value)?;
                debug!("restored heartbeat publication");
            }
        }
        RecordKey::Cfg => {
            if value.is_empty() {
                *target.stored_cfg = None;
                debug!("cleared configuration state");
            } else {
                *target.stored_cfg = Some(records::decode_cfg(key, value)?);
                debug!("restored configuration state");
            }
        }
        RecordKey::Role => {
            state.role = if value.is_empty() {
                None
            } else {
                Some(records::decode_role(key, value)?)
            };
            debug!(role = ?state.role, "restored role");
        }
        RecordKey::Label(slot) => {
            let index = usize::from(slot);
            if value.is_empty() {
                state.labels.free(index);
                return Ok(Applied::State);
            }
            let label: Label = records::decode_label(key, value)?;
            if label.is_deleted() {
                warn!(slot, "ignoring virtual address with no references");
                return Ok(Applied::State);
            }
            state
                .labels
                .put(index, label)
                .map_err(|err| DecodeError::Exhausted(err.table))?;
            debug!(addr = label.addr, refs = label.ref_count, "restored virtual address");
        }
        RecordKey::Node(addr) => {
            if value.is_empty() {
                if state.nodes.remove(addr).is_some() {
                    debug!(addr, "deleted node");
                }
                return Ok(Applied::State);
            }
            let node = records::decode_node(key, addr, value)?;
            let slot = state
                .nodes
                .find_or_allocate(addr, || node)
                .map_err(|err| DecodeError::Exhausted(err.table))?;
            *slot = node;
            debug!(addr, "node recovered from storage");
        }
        RecordKey::Model { id, attr } => return apply_model(state, key, id, attr, value),
    }

    Ok(Applied::State)
}

fn apply_model(
    state: &mut MeshState,
    key: &RecordKey,
    id: ModelId,
    attr: ModelAttr,
    value: &[u8],
) -> Result<Applied, DecodeError> {
    let model = state.model_mut(id).ok_or(DecodeError::UnknownModel {
        vendor: id.vendor,
        elem_idx: id.elem_idx,
        mod_idx: id.mod_idx,
    })?;

    match attr {
        ModelAttr::Bind => {
            // Start empty whether the value sets or clears
            model.keys = [KEY_UNUSED; crate::config::MODEL_KEY_COUNT];
            if !value.is_empty() {
                model.keys = records::decode_bind(key, value)?;
            }
        }
        ModelAttr::Sub => {
            model.groups = [ADDR_UNASSIGNED; crate::config::MODEL_GROUP_COUNT];
            if !value.is_empty() {
                model.groups = records::decode_sub(key, value)?;
            }
        }
        ModelAttr::Pub => {
            let publication = model
                .publication
                .as_mut()
                .ok_or_else(|| DecodeError::NoPublication(key.to_string()))?;
            if value.is_empty() {
                publication.clear();
            } else {
                *publication = records::decode_pub(key, value)?;
                debug!(
                    dst = publication.addr,
                    app_idx = publication.key,
                    "restored model publication"
                );
            }
        }
        ModelAttr::Data => {
            if value.is_empty() {
                model.data_present = false;
                return Ok(Applied::State);
            }
            if value.len() > MODEL_DATA_MAX {
                return Err(DecodeError::Length {
                    key: key.to_string(),
                    expected: MODEL_DATA_MAX,
                    actual: value.len(),
                });
            }
            model.data_present = true;
            return Ok(Applied::ModelData(id));
        }
    }

    Ok(Applied::State)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Model, Subnet};

    fn restore<'a>(state: &'a mut MeshState, cfg: &'a mut Option<ConfigState>) -> Restore<'a> {
        Restore {
            state,
            stored_cfg: cfg,
            seq_store_rate: 128,
        }
    }

    #[test]
    fn test_key_format() {
        assert_eq!(RecordKey::Rpl(0x1234).to_string(), "RPL/1234");
        assert_eq!(RecordKey::NetKey(0x003).to_string(), "NetKey/3");
        assert_eq!(RecordKey::Iv.to_string(), "IV");
        assert_eq!(
            RecordKey::Model {
                id: ModelId::vendor(1, 0x0a),
                attr: ModelAttr::Pub
            }
            .to_string(),
            "v/10a/pub"
        );
        assert_eq!(RecordKey::Label(2).to_string(), "Va/2");
    }

    #[test]
    fn test_key_parse() {
        assert_eq!("HBPub".parse::<RecordKey>().unwrap(), RecordKey::HbPub);
        assert_eq!("AppKey/fff".parse::<RecordKey>().unwrap(), RecordKey::AppKey(0xfff));
        assert_eq!(
            "s/3/sub".parse::<RecordKey>().unwrap(),
            RecordKey::Model {
                id: ModelId::sig(0, 3),
                attr: ModelAttr::Sub
            }
        );

        assert!(matches!("Foo".parse::<RecordKey>(), Err(DecodeError::UnknownCategory(_))));
        assert!(matches!("RPL".parse::<RecordKey>(), Err(DecodeError::MalformedKey(_))));
        assert!(matches!("RPL/xyz".parse::<RecordKey>(), Err(DecodeError::MalformedKey(_))));
        assert!(matches!("Net/1".parse::<RecordKey>(), Err(DecodeError::MalformedKey(_))));
        assert!(matches!("s/1/keys".parse::<RecordKey>(), Err(DecodeError::UnknownAttribute(_))));
    }

    #[test]
    fn test_resume_seq_rounds_to_store_rate() {
        assert_eq!(resume_seq(0, 128), 127);
        assert_eq!(resume_seq(1, 128), 127);
        assert_eq!(resume_seq(127, 128), 127);
        assert_eq!(resume_seq(128, 128), 255);
        assert_eq!(resume_seq(300, 0), 300);
    }

    #[test]
    fn test_empty_value_deletes_sparse_entities() {
        let mut state = MeshState::default();
        let mut cfg = None;
        state.subnets.allocate(Subnet::new(3, [1; 16])).unwrap();
        state.replay.allocate(ReplayEntry::new(0x10, 5, false)).unwrap();

        let mut target = restore(&mut state, &mut cfg);
        apply(&mut target, &RecordKey::NetKey(3), &[]).unwrap();
        apply(&mut target, &RecordKey::Rpl(0x10), &[]).unwrap();
        // Unknown ids are a no-op
        apply(&mut target, &RecordKey::Node(0x99), &[]).unwrap();

        assert!(state.subnets.is_empty());
        assert!(state.replay.is_empty());
    }

    #[test]
    fn test_label_with_zero_refs_is_ignored() {
        let mut state = MeshState::default();
        let mut cfg = None;
        let mut label = Label::new(0x8123, [7; 16]);
        label.ref_count = 0;

        let mut target = restore(&mut state, &mut cfg);
        apply(&mut target, &RecordKey::Label(1), &records::encode_label(&label)).unwrap();
        assert!(state.labels.slot(1).is_none());
    }

    #[test]
    fn test_model_records() {
        let mut state = MeshState::new(vec![
            Model::new(ModelId::sig(0, 0)),
            Model::with_publication(ModelId::sig(0, 1)),
        ]);
        let mut cfg = None;
        let mut target = restore(&mut state, &mut cfg);

        let pub_key = RecordKey::Model {
            id: ModelId::sig(0, 0),
            attr: ModelAttr::Pub,
        };
        assert!(matches!(
            apply(&mut target, &pub_key, &[0; records::PUB_LEN]),
            Err(DecodeError::NoPublication(_))
        ));

        let missing = RecordKey::Model {
            id: ModelId::vendor(0, 0),
            attr: ModelAttr::Bind,
        };
        assert!(matches!(
            apply(&mut target, &missing, &[]),
            Err(DecodeError::UnknownModel { vendor: true, .. })
        ));

        let data_key = RecordKey::Model {
            id: ModelId::sig(0, 1),
            attr: ModelAttr::Data,
        };
        assert_eq!(
            apply(&mut target, &data_key, b"blob").unwrap(),
            Applied::ModelData(ModelId::sig(0, 1))
        );
        assert!(state.models[1].data_present);
    }
}
