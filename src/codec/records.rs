//! Fixed binary record layouts
//!
//! Every persisted entity has one exact byte layout. All multi-byte fields are
//! little-endian and bit fields are packed explicitly, so the stored bytes do
//! not depend on the host's struct layout.
//!
//! Encoders take the in-memory entity and return a fixed-size array. Decoders
//! check the exact length first; an empty value never reaches them since the
//! dispatcher treats it as a delete.

use crate::codec::RecordKey;
use crate::config::{MODEL_GROUP_COUNT, MODEL_KEY_COUNT};
use crate::error::DecodeError;
use crate::state::{
    AppKey, AppKeyMaterial, ConfigState, HeartbeatPublication, IvState, Label, ModelPublication,
    NetworkIdentity, Node, ReplayEntry, Role, Subnet, KEY_INDEX_MAX, SEQ_MAX,
};

/// `Net`: primary address and device key
pub const NET_LEN: usize = 18;
/// `IV`: index plus packed update flag and duration
pub const IV_LEN: usize = 5;
/// `Seq`: 24-bit counter
pub const SEQ_LEN: usize = 3;
/// `RPL/<src>`: packed sequence and old-IV flag
pub const RPL_LEN: usize = 4;
/// `NetKey/<idx>`: packed refresh state and two keys
pub const NET_KEY_LEN: usize = 33;
/// `AppKey/<idx>`: bound net index, updated flag, two keys
pub const APP_KEY_LEN: usize = 35;
/// `HBPub`: heartbeat publication
pub const HB_PUB_LEN: usize = 8;
/// `Cfg`: configuration server state
pub const CFG_LEN: usize = 7;
/// `<s|v>/<key>/bind`: bound AppKey indices
pub const BIND_LEN: usize = 2 * MODEL_KEY_COUNT;
/// `<s|v>/<key>/sub`: subscribed group addresses
pub const SUB_LEN: usize = 2 * MODEL_GROUP_COUNT;
/// `<s|v>/<key>/pub`: model publication
pub const PUB_LEN: usize = 8;
/// `Va/<slot>`: virtual address label
pub const VA_LEN: usize = 20;
/// `Node/<addr>`: node registry entry
pub const NODE_LEN: usize = 19;
/// `Role`: operating role
pub const ROLE_LEN: usize = 1;

const HB_INDEFINITE: u16 = 1 << 12;
const RPL_OLD_IV: u32 = 1 << 24;

/// Borrow `value` as an array of exactly `N` bytes
fn exact<'a, const N: usize>(key: &RecordKey, value: &'a [u8]) -> Result<&'a [u8; N], DecodeError> {
    value.try_into().map_err(|_| DecodeError::Length {
        key: key.to_string(),
        expected: N,
        actual: value.len(),
    })
}

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn key_at(bytes: &[u8], offset: usize) -> [u8; 16] {
    let mut key = [0u8; 16];
    key.copy_from_slice(&bytes[offset..offset + 16]);
    key
}

/// Encode the network identity
pub fn encode_net(identity: &NetworkIdentity) -> [u8; NET_LEN] {
    let mut out = [0u8; NET_LEN];
    out[0..2].copy_from_slice(&identity.primary_addr.to_le_bytes());
    out[2..18].copy_from_slice(&identity.dev_key);
    out
}

/// Decode the network identity
pub fn decode_net(key: &RecordKey, value: &[u8]) -> Result<NetworkIdentity, DecodeError> {
    let bytes = exact::<NET_LEN>(key, value)?;
    Ok(NetworkIdentity {
        primary_addr: u16_at(bytes, 0),
        dev_key: key_at(bytes, 2),
    })
}

/// Encode the IV state
pub fn encode_iv(iv: &IvState) -> [u8; IV_LEN] {
    let mut out = [0u8; IV_LEN];
    out[0..4].copy_from_slice(&iv.index.to_le_bytes());
    out[4] = u8::from(iv.update_in_progress) | (iv.duration_hours << 1);
    out
}

/// Decode the IV state
pub fn decode_iv(key: &RecordKey, value: &[u8]) -> Result<IvState, DecodeError> {
    let bytes = exact::<IV_LEN>(key, value)?;
    Ok(IvState {
        index: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        update_in_progress: bytes[4] & 0x01 != 0,
        duration_hours: bytes[4] >> 1,
    })
}

/// Encode the sequence number
pub fn encode_seq(seq: u32) -> [u8; SEQ_LEN] {
    let [b0, b1, b2, _] = seq.to_le_bytes();
    [b0, b1, b2]
}

/// Decode the sequence number
pub fn decode_seq(key: &RecordKey, value: &[u8]) -> Result<u32, DecodeError> {
    let bytes = exact::<SEQ_LEN>(key, value)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
}

/// Encode the replay entry
pub fn encode_rpl(entry: &ReplayEntry) -> [u8; RPL_LEN] {
    let mut packed = entry.seq & SEQ_MAX;
    if entry.old_iv {
        packed |= RPL_OLD_IV;
    }
    packed.to_le_bytes()
}

/// Decoded `(seq, old_iv)`
pub fn decode_rpl(key: &RecordKey, value: &[u8]) -> Result<(u32, bool), DecodeError> {
    let packed = u32::from_le_bytes(*exact::<RPL_LEN>(key, value)?);
    Ok((packed & SEQ_MAX, packed & RPL_OLD_IV != 0))
}

/// Encode the network key
pub fn encode_net_key(subnet: &Subnet) -> [u8; NET_KEY_LEN] {
    let mut out = [0u8; NET_KEY_LEN];
    out[0] = u8::from(subnet.kr_flag) | (subnet.kr_phase << 1);
    out[1..17].copy_from_slice(&subnet.keys[0]);
    out[17..33].copy_from_slice(&subnet.keys[1]);
    out
}

/// Decode the network key
pub fn decode_net_key(key: &RecordKey, net_idx: u16, value: &[u8]) -> Result<Subnet, DecodeError> {
    let bytes = exact::<NET_KEY_LEN>(key, value)?;
    Ok(Subnet {
        net_idx,
        kr_flag: bytes[0] & 0x01 != 0,
        kr_phase: bytes[0] >> 1,
        keys: [key_at(bytes, 1), key_at(bytes, 17)],
    })
}

/// Encode the application key
pub fn encode_app_key(app_key: &AppKey) -> [u8; APP_KEY_LEN] {
    let mut out = [0u8; APP_KEY_LEN];
    out[0..2].copy_from_slice(&app_key.net_idx.to_le_bytes());
    out[2] = u8::from(app_key.updated);
    out[3..19].copy_from_slice(&app_key.keys[0].val);
    out[19..35].copy_from_slice(&app_key.keys[1].val);
    out
}

/// Application ids are left zero; they are derived at commit
pub fn decode_app_key(key: &RecordKey, app_idx: u16, value: &[u8]) -> Result<AppKey, DecodeError> {
    let bytes = exact::<APP_KEY_LEN>(key, value)?;
    Ok(AppKey {
        app_idx,
        net_idx: u16_at(bytes, 0),
        updated: bytes[2] != 0,
        keys: [
            AppKeyMaterial {
                val: key_at(bytes, 3),
                id: 0,
            },
            AppKeyMaterial {
                val: key_at(bytes, 19),
                id: 0,
            },
        ],
    })
}

/// Encode the heartbeat publication
pub fn encode_hb_pub(heartbeat: &HeartbeatPublication) -> [u8; HB_PUB_LEN] {
    let mut out = [0u8; HB_PUB_LEN];
    out[0..2].copy_from_slice(&heartbeat.dst.to_le_bytes());
    out[2] = heartbeat.period;
    out[3] = heartbeat.ttl;
    out[4..6].copy_from_slice(&heartbeat.feat.to_le_bytes());
    let mut tail = heartbeat.net_idx & KEY_INDEX_MAX;
    if heartbeat.count == HeartbeatPublication::COUNT_INDEFINITE {
        tail |= HB_INDEFINITE;
    }
    out[6..8].copy_from_slice(&tail.to_le_bytes());
    out
}

/// Only the indefinite flag survives a reload: count is 0xFFFF or 0
pub fn decode_hb_pub(key: &RecordKey, value: &[u8]) -> Result<HeartbeatPublication, DecodeError> {
    let bytes = exact::<HB_PUB_LEN>(key, value)?;
    let tail = u16_at(bytes, 6);
    Ok(HeartbeatPublication {
        dst: u16_at(bytes, 0),
        count: if tail & HB_INDEFINITE != 0 {
            HeartbeatPublication::COUNT_INDEFINITE
        } else {
            0
        },
        period: bytes[2],
        ttl: bytes[3],
        feat: u16_at(bytes, 4),
        net_idx: tail & KEY_INDEX_MAX,
    })
}

/// Encode the configuration state
pub fn encode_cfg(cfg: &ConfigState) -> [u8; CFG_LEN] {
    [
        cfg.net_transmit,
        cfg.relay,
        cfg.relay_retransmit,
        cfg.beacon,
        cfg.gatt_proxy,
        cfg.frnd,
        cfg.default_ttl,
    ]
}

/// Decode the configuration state
pub fn decode_cfg(key: &RecordKey, value: &[u8]) -> Result<ConfigState, DecodeError> {
    let bytes = exact::<CFG_LEN>(key, value)?;
    Ok(ConfigState {
        net_transmit: bytes[0],
        relay: bytes[1],
        relay_retransmit: bytes[2],
        beacon: bytes[3],
        gatt_proxy: bytes[4],
        frnd: bytes[5],
        default_ttl: bytes[6],
    })
}

fn encode_u16_list<const N: usize, const L: usize>(list: &[u16; N]) -> [u8; L] {
    let mut out = [0u8; L];
    for (chunk, value) in out.chunks_exact_mut(2).zip(list) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    out
}

fn decode_u16_list<const N: usize>(bytes: &[u8]) -> [u16; N] {
    let mut list = [0u16; N];
    for (value, chunk) in list.iter_mut().zip(bytes.chunks_exact(2)) {
        *value = u16::from_le_bytes([chunk[0], chunk[1]]);
    }
    list
}

/// Encode the model key bindings
pub fn encode_bind(keys: &[u16; MODEL_KEY_COUNT]) -> [u8; BIND_LEN] {
    encode_u16_list(keys)
}

/// Decode the model key bindings
pub fn decode_bind(key: &RecordKey, value: &[u8]) -> Result<[u16; MODEL_KEY_COUNT], DecodeError> {
    let bytes = exact::<BIND_LEN>(key, value)?;
    Ok(decode_u16_list(bytes))
}

/// Encode the model subscriptions
pub fn encode_sub(groups: &[u16; MODEL_GROUP_COUNT]) -> [u8; SUB_LEN] {
    encode_u16_list(groups)
}

/// Decode the model subscriptions
pub fn decode_sub(key: &RecordKey, value: &[u8]) -> Result<[u16; MODEL_GROUP_COUNT], DecodeError> {
    let bytes = exact::<SUB_LEN>(key, value)?;
    Ok(decode_u16_list(bytes))
}

/// Encode the model publication
pub fn encode_pub(publication: &ModelPublication) -> [u8; PUB_LEN] {
    let mut out = [0u8; PUB_LEN];
    out[0..2].copy_from_slice(&publication.addr.to_le_bytes());
    out[2..4].copy_from_slice(&publication.key.to_le_bytes());
    out[4] = publication.ttl;
    out[5] = publication.retransmit;
    out[6] = publication.period;
    out[7] = (publication.period_div & 0x0f) | (u8::from(publication.cred) << 4);
    out
}

/// The runtime retransmission count restarts at zero
pub fn decode_pub(key: &RecordKey, value: &[u8]) -> Result<ModelPublication, DecodeError> {
    let bytes = exact::<PUB_LEN>(key, value)?;
    Ok(ModelPublication {
        addr: u16_at(bytes, 0),
        key: u16_at(bytes, 2),
        ttl: bytes[4],
        retransmit: bytes[5],
        period: bytes[6],
        period_div: bytes[7] & 0x0f,
        cred: bytes[7] & 0x10 != 0,
        count: 0,
    })
}

/// Encode the virtual address label
pub fn encode_label(label: &Label) -> [u8; VA_LEN] {
    let mut out = [0u8; VA_LEN];
    out[0..2].copy_from_slice(&label.ref_count.to_le_bytes());
    out[2..4].copy_from_slice(&label.addr.to_le_bytes());
    out[4..20].copy_from_slice(&label.uuid);
    out
}

/// Decode the virtual address label
pub fn decode_label(key: &RecordKey, value: &[u8]) -> Result<Label, DecodeError> {
    let bytes = exact::<VA_LEN>(key, value)?;
    Ok(Label {
        ref_count: u16_at(bytes, 0),
        addr: u16_at(bytes, 2),
        uuid: key_at(bytes, 4),
        changed: false,
    })
}

/// Encode the node registry entry
pub fn encode_node(node: &Node) -> [u8; NODE_LEN] {
    let mut out = [0u8; NODE_LEN];
    out[0..2].copy_from_slice(&node.net_idx.to_le_bytes());
    out[2..18].copy_from_slice(&node.dev_key);
    out[18] = node.num_elem;
    out
}

/// Decode the node registry entry
pub fn decode_node(key: &RecordKey, addr: u16, value: &[u8]) -> Result<Node, DecodeError> {
    let bytes = exact::<NODE_LEN>(key, value)?;
    Ok(Node {
        addr,
        net_idx: u16_at(bytes, 0),
        dev_key: key_at(bytes, 2),
        num_elem: bytes[18],
    })
}

/// Encode the role
pub fn encode_role(role: Role) -> [u8; ROLE_LEN] {
    [role.to_byte()]
}

/// Decode the role
pub fn decode_role(key: &RecordKey, value: &[u8]) -> Result<Role, DecodeError> {
    let bytes = exact::<ROLE_LEN>(key, value)?;
    Role::from_byte(bytes[0]).ok_or_else(|| DecodeError::Invalid {
        key: key.to_string(),
        reason: "unknown role",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ModelAttr;
    use crate::state::keys::kr_phase;
    use crate::state::{HeartbeatPublication, ModelId};

    #[test]
    fn test_iv_bit_packing() {
        let iv = IvState {
            index: 0xdead_beef,
            update_in_progress: true,
            duration_hours: 0x7f,
        };
        let bytes = encode_iv(&iv);
        assert_eq!(bytes, [0xef, 0xbe, 0xad, 0xde, 0xff]);
        assert_eq!(decode_iv(&RecordKey::Iv, &bytes).unwrap(), iv);
    }

    #[test]
    fn test_seq_is_24_bit_little_endian() {
        assert_eq!(encode_seq(0x00ab_cdef), [0xef, 0xcd, 0xab]);
        assert_eq!(encode_seq(0x1234_5678), [0x78, 0x56, 0x34]);
        assert_eq!(decode_seq(&RecordKey::Seq, &[0xff, 0xff, 0xff]).unwrap(), SEQ_MAX);
    }

    #[test]
    fn test_rpl_packs_old_iv_above_seq() {
        let entry = ReplayEntry::new(0x1234, SEQ_MAX, true);
        let bytes = encode_rpl(&entry);
        assert_eq!(bytes, [0xff, 0xff, 0xff, 0x01]);
        assert_eq!(decode_rpl(&RecordKey::Rpl(0x1234), &bytes).unwrap(), (SEQ_MAX, true));
    }

    #[test]
    fn test_hb_pub_indefinite_bit() {
        let mut heartbeat = HeartbeatPublication {
            dst: 0xc001,
            count: HeartbeatPublication::COUNT_INDEFINITE,
            period: 3,
            ttl: 5,
            feat: 0x000f,
            net_idx: KEY_INDEX_MAX,
        };
        let bytes = encode_hb_pub(&heartbeat);
        assert_eq!(&bytes[6..8], &[0xff, 0x1f]);
        assert_eq!(decode_hb_pub(&RecordKey::HbPub, &bytes).unwrap(), heartbeat);

        // A finite count is not persisted
        heartbeat.count = 12;
        let restored = decode_hb_pub(&RecordKey::HbPub, &encode_hb_pub(&heartbeat)).unwrap();
        assert_eq!(restored.count, 0);
    }

    #[test]
    fn test_pub_divisor_and_credentials() {
        let publication = ModelPublication {
            addr: 0xc100,
            key: 0x0abc,
            cred: true,
            ttl: 0x7f,
            retransmit: 0x15,
            period: 0x41,
            period_div: 0x0f,
            count: 3,
        };
        let bytes = encode_pub(&publication);
        assert_eq!(bytes[7], 0x1f);

        let restored = decode_pub(&RecordKey::Iv, &bytes).unwrap();
        assert_eq!(restored.count, 0);
        assert_eq!(ModelPublication { count: 3, ..restored }, publication);
    }

    #[test]
    fn test_net_identity_layout() {
        let identity = NetworkIdentity {
            primary_addr: 0x7fff,
            dev_key: *b"0123456789abcdef",
        };
        let bytes = encode_net(&identity);
        assert_eq!(&bytes[..2], &[0xff, 0x7f]);
        assert_eq!(decode_net(&RecordKey::Net, &bytes).unwrap(), identity);
    }

    #[test]
    fn test_net_key_keeps_both_slots_and_phase() {
        let subnet = Subnet {
            net_idx: KEY_INDEX_MAX,
            kr_flag: true,
            kr_phase: kr_phase::PHASE_2,
            keys: [[0x11; 16], [0x22; 16]],
        };
        let bytes = encode_net_key(&subnet);
        assert_eq!(bytes[0], 0x05);
        assert_eq!(&bytes[1..17], &[0x11; 16]);
        assert_eq!(&bytes[17..33], &[0x22; 16]);

        let key = RecordKey::NetKey(KEY_INDEX_MAX);
        assert_eq!(decode_net_key(&key, KEY_INDEX_MAX, &bytes).unwrap(), subnet);
    }

    #[test]
    fn test_app_key_ids_are_not_stored() {
        let app_key = AppKey {
            app_idx: 0x0123,
            net_idx: KEY_INDEX_MAX,
            updated: true,
            keys: [
                AppKeyMaterial {
                    val: [0x33; 16],
                    id: 0x2a,
                },
                AppKeyMaterial {
                    val: [0x44; 16],
                    id: 0x15,
                },
            ],
        };
        let bytes = encode_app_key(&app_key);
        assert_eq!(&bytes[..3], &[0xff, 0x0f, 0x01]);

        let restored = decode_app_key(&RecordKey::AppKey(0x0123), 0x0123, &bytes).unwrap();
        assert_eq!(restored.net_idx, KEY_INDEX_MAX);
        assert!(restored.updated);
        assert_eq!(restored.keys[0].val, [0x33; 16]);
        assert_eq!(restored.keys[1].val, [0x44; 16]);
        assert_eq!((restored.keys[0].id, restored.keys[1].id), (0, 0));
    }

    #[test]
    fn test_cfg_field_order() {
        let cfg = ConfigState {
            net_transmit: 1,
            relay: 2,
            relay_retransmit: 3,
            beacon: 4,
            gatt_proxy: 5,
            frnd: 6,
            default_ttl: 7,
        };
        let bytes = encode_cfg(&cfg);
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(decode_cfg(&RecordKey::Cfg, &bytes).unwrap(), cfg);
    }

    #[test]
    fn test_full_bind_and_sub_lists() {
        let id = ModelId::sig(1, 2);
        let keys = [KEY_INDEX_MAX, 0x0000, 0x0001, 0x07ff];
        let bytes = encode_bind(&keys);
        assert_eq!(&bytes[..2], &[0xff, 0x0f]);
        let key = RecordKey::Model {
            id,
            attr: ModelAttr::Bind,
        };
        assert_eq!(decode_bind(&key, &bytes).unwrap(), keys);

        let groups = [0xc000, 0xffff, 0xfffd, 0xc123];
        let key = RecordKey::Model {
            id,
            attr: ModelAttr::Sub,
        };
        assert_eq!(decode_sub(&key, &encode_sub(&groups)).unwrap(), groups);
    }

    #[test]
    fn test_label_layout() {
        let label = Label {
            ref_count: u16::MAX,
            addr: 0xbfff,
            uuid: *b"fedcba9876543210",
            changed: true,
        };
        let bytes = encode_label(&label);
        assert_eq!(&bytes[..4], &[0xff, 0xff, 0xff, 0xbf]);

        let restored = decode_label(&RecordKey::Label(3), &bytes).unwrap();
        assert!(!restored.changed, "the changed flag is runtime only");
        assert_eq!(Label { changed: true, ..restored }, label);
    }

    #[test]
    fn test_node_layout() {
        let node = Node {
            addr: 0x7fff,
            net_idx: KEY_INDEX_MAX,
            num_elem: u8::MAX,
            dev_key: [0x5c; 16],
        };
        let bytes = encode_node(&node);
        assert_eq!(bytes[18], 0xff);
        assert_eq!(decode_node(&RecordKey::Node(0x7fff), 0x7fff, &bytes).unwrap(), node);
    }

    #[test]
    fn test_length_mismatch_is_reported() {
        let err = decode_cfg(&RecordKey::Cfg, &[0; 6]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Length {
                key: "Cfg".to_string(),
                expected: CFG_LEN,
                actual: 6
            }
        );
        assert!(decode_net_key(&RecordKey::NetKey(1), 1, &[0; 34]).is_err());
    }

    #[test]
    fn test_unknown_role_byte() {
        assert!(matches!(
            decode_role(&RecordKey::Role, &[3]),
            Err(DecodeError::Invalid { .. })
        ));
        assert_eq!(decode_role(&RecordKey::Role, &[2]).unwrap(), Role::Provisioner);
    }
}
