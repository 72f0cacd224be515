//! The flush pass
//!
//! A pass takes everything pending, serializes it under the state lock and
//! then performs the backend writes with only the backend lock held. Writes go
//! out in a fixed category order. The first failing write aborts the pass and
//! everything not yet written is marked dirty again.

use crate::codec::{records, ModelAttr, RecordKey};
use crate::engine::Inner;
use crate::error::Result;
use crate::pending::{Category, KeyKind, KeyUpdate, NodeUpdate, TakenChanges, UpdateOp};
use crate::state::{MeshState, ModelId};
use crate::store::Backend;
use std::sync::atomic::Ordering;
use tracing::{debug, error, warn};

/// Where a write came from, so a failed pass can mark it again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// A whole category
    Category(Category),
    /// One entry of the key update table
    Key(KeyUpdate),
    /// One entry of the node update table
    Node(NodeUpdate),
    /// One replay entry
    Replay(u16),
    /// One model attribute
    Model(ModelId, ModelAttr),
    /// One label slot
    Label(usize),
}

/// One backend update
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Write {
    pub key: RecordKey,
    /// `None` deletes
    pub value: Option<Vec<u8>>,
    pub origin: Origin,
}

impl Write {
    fn store(key: RecordKey, value: &[u8], origin: Origin) -> Self {
        Self {
            key,
            value: Some(value.to_vec()),
            origin,
        }
    }

    fn delete(key: RecordKey, origin: Origin) -> Self {
        Self {
            key,
            value: None,
            origin,
        }
    }
}

/// Summary of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Backend updates performed
    pub written: usize,
}

/// Serialize everything owed for `changes`, clearing per-entity flags
pub(crate) fn collect_writes(state: &mut MeshState, changes: &TakenChanges) -> Vec<Write> {
    let mut writes = Vec::new();

    for category in changes.dirty.iter() {
        match category {
            Category::Rpl => collect_replay(state, &mut writes),
            Category::Keys => collect_keys(state, &changes.keys, &mut writes),
            Category::Net => {
                let origin = Origin::Category(Category::Net);
                writes.push(if state.valid {
                    Write::store(RecordKey::Net, &records::encode_net(&state.identity), origin)
                } else {
                    Write::delete(RecordKey::Net, origin)
                });
            }
            Category::Iv => {
                let origin = Origin::Category(Category::Iv);
                writes.push(if state.valid {
                    Write::store(RecordKey::Iv, &records::encode_iv(&state.iv), origin)
                } else {
                    Write::delete(RecordKey::Iv, origin)
                });
            }
            Category::Seq => writes.push(Write::store(
                RecordKey::Seq,
                &records::encode_seq(state.seq),
                Origin::Category(Category::Seq),
            )),
            Category::HbPub => {
                // A disabled publication is written as all zeros
                let value = if state.heartbeat.is_enabled() {
                    records::encode_hb_pub(&state.heartbeat)
                } else {
                    [0; records::HB_PUB_LEN]
                };
                writes.push(Write::store(
                    RecordKey::HbPub,
                    &value,
                    Origin::Category(Category::HbPub),
                ));
            }
            Category::Cfg => {
                let origin = Origin::Category(Category::Cfg);
                writes.push(if state.valid {
                    Write::store(RecordKey::Cfg, &records::encode_cfg(&state.cfg), origin)
                } else {
                    Write::delete(RecordKey::Cfg, origin)
                });
            }
            Category::Model => collect_models(state, &mut writes),
            Category::Labels => collect_labels(state, &mut writes),
            Category::Role => match state.role {
                Some(role) => writes.push(Write::store(
                    RecordKey::Role,
                    &records::encode_role(role),
                    Origin::Category(Category::Role),
                )),
                None => error!("unknown mesh role, not stored"),
            },
            Category::Nodes => collect_nodes(state, &changes.nodes, &mut writes),
        }
    }

    writes
}

fn collect_replay(state: &mut MeshState, writes: &mut Vec<Write>) {
    if state.valid {
        for (_, entry) in state.replay.iter_mut() {
            if entry.store_pending {
                entry.store_pending = false;
                writes.push(Write::store(
                    RecordKey::Rpl(entry.src),
                    &records::encode_rpl(entry),
                    Origin::Replay(entry.src),
                ));
            }
        }
    } else {
        // Entries are freed once their delete has reached storage
        for (_, entry) in state.replay.iter() {
            writes.push(Write::delete(RecordKey::Rpl(entry.src), Origin::Replay(entry.src)));
        }
    }
}

fn collect_keys(state: &MeshState, updates: &[KeyUpdate], writes: &mut Vec<Write>) {
    for update in updates {
        let origin = Origin::Key(*update);
        let key = match update.kind {
            KeyKind::Net => RecordKey::NetKey(update.idx),
            KeyKind::App => RecordKey::AppKey(update.idx),
        };

        if update.op == UpdateOp::Clear {
            writes.push(Write::delete(key, origin));
            continue;
        }

        match update.kind {
            KeyKind::Net => match state.subnets.find(update.idx) {
                Some(subnet) => {
                    writes.push(Write::store(key, &records::encode_net_key(subnet), origin))
                }
                None => warn!(net_idx = update.idx, "NetKeyIndex not found"),
            },
            KeyKind::App => match state.app_keys.find(update.idx) {
                Some(app_key) => {
                    writes.push(Write::store(key, &records::encode_app_key(app_key), origin))
                }
                None => warn!(app_idx = update.idx, "AppKeyIndex not found"),
            },
        }
    }
}

fn collect_models(state: &mut MeshState, writes: &mut Vec<Write>) {
    for model in state.models.iter_mut().filter(|model| model.has_pending()) {
        let id = model.id;

        if std::mem::take(&mut model.bind_pending) {
            writes.push(Write::store(
                RecordKey::Model { id, attr: ModelAttr::Bind },
                &records::encode_bind(&model.keys),
                Origin::Model(id, ModelAttr::Bind),
            ));
        }

        if std::mem::take(&mut model.sub_pending) {
            writes.push(Write::store(
                RecordKey::Model { id, attr: ModelAttr::Sub },
                &records::encode_sub(&model.groups),
                Origin::Model(id, ModelAttr::Sub),
            ));
        }

        if std::mem::take(&mut model.pub_pending) {
            match &model.publication {
                Some(publication) => {
                    let value = if publication.is_assigned() {
                        records::encode_pub(publication)
                    } else {
                        [0; records::PUB_LEN]
                    };
                    writes.push(Write::store(
                        RecordKey::Model { id, attr: ModelAttr::Pub },
                        &value,
                        Origin::Model(id, ModelAttr::Pub),
                    ));
                }
                None => warn!(model = ?id, "model has no publication context"),
            }
        }
    }
}

fn collect_labels(state: &mut MeshState, writes: &mut Vec<Write>) {
    for (slot, label) in state.labels.iter_mut() {
        if !std::mem::take(&mut label.changed) {
            continue;
        }
        let key = RecordKey::Label(slot as u16);
        writes.push(if label.is_deleted() {
            Write::delete(key, Origin::Label(slot))
        } else {
            Write::store(key, &records::encode_label(label), Origin::Label(slot))
        });
    }
}

fn collect_nodes(state: &MeshState, updates: &[NodeUpdate], writes: &mut Vec<Write>) {
    for update in updates {
        let key = RecordKey::Node(update.addr);
        let origin = Origin::Node(*update);
        match update.op {
            UpdateOp::Clear => writes.push(Write::delete(key, origin)),
            UpdateOp::Store => match state.nodes.find(update.addr) {
                Some(node) => {
                    writes.push(Write::store(key, &records::encode_node(node), origin))
                }
                None => warn!(addr = update.addr, "node not found"),
            },
        }
    }
}

impl<B: Backend> Inner<B> {
    /// Run one flush pass
    pub(crate) fn run_pass(&self) -> Result<FlushReport> {
        let _pass = self.flush_lock.lock();

        let changes = self.pending.lock().take();
        if changes.dirty.is_empty() {
            return Ok(FlushReport::default());
        }
        debug!(dirty = ?changes.dirty, "flush pass started");

        let writes = {
            let mut state = self.state.lock();
            collect_writes(&mut state, &changes)
        };

        let mut cleared_replay = Vec::new();
        let mut backend = self.backend.lock();
        for (done, write) in writes.iter().enumerate() {
            let key = write.key.to_string();
            if let Err(err) = backend.update(&key, write.value.as_deref()) {
                drop(backend);
                error!(key = %key, error = %err, "failed to store settings, pass aborted");
                self.forget_replay(&cleared_replay);
                let requeued = self.requeue(&writes[done..]);
                debug!(requeued, "unwritten settings marked dirty again");
                return Err(err.into());
            }
            match (write.origin, &write.value) {
                (Origin::Replay(src), None) => {
                    cleared_replay.push(src);
                    debug!(key = %key, "cleared");
                }
                (_, None) => debug!(key = %key, "cleared"),
                (_, Some(_)) => debug!(key = %key, "stored"),
            }
            self.save_pending.store(true, Ordering::Release);
        }
        drop(backend);
        self.forget_replay(&cleared_replay);

        debug!(written = writes.len(), "flush pass complete");
        Ok(FlushReport {
            written: writes.len(),
        })
    }

    /// Free replay entries whose records were deleted
    ///
    /// Skipped once the state is valid again, since the entries are live then.
    fn forget_replay(&self, sources: &[u16]) {
        if sources.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if state.valid {
            return;
        }
        for src in sources {
            state.replay.remove(*src);
        }
    }

    /// Mark `writes` dirty again and ask for another pass
    fn requeue(&self, writes: &[Write]) -> usize {
        let mut retry = TakenChanges::default();
        {
            let mut state = self.state.lock();
            for write in writes {
                match write.origin {
                    Origin::Category(category) => retry.dirty.insert(category),
                    Origin::Key(update) => {
                        retry.dirty.insert(Category::Keys);
                        retry.keys.push(update);
                    }
                    Origin::Node(update) => {
                        retry.dirty.insert(Category::Nodes);
                        retry.nodes.push(update);
                    }
                    Origin::Replay(src) => {
                        // A failed delete is retried while the entry is still held
                        if write.value.is_some() {
                            if let Some(entry) = state.replay.find_mut(src) {
                                entry.store_pending = true;
                            }
                        }
                        retry.dirty.insert(Category::Rpl);
                    }
                    Origin::Model(id, attr) => {
                        if let Some(model) = state.model_mut(id) {
                            match attr {
                                ModelAttr::Bind => model.bind_pending = true,
                                ModelAttr::Sub => model.sub_pending = true,
                                ModelAttr::Pub => model.pub_pending = true,
                                ModelAttr::Data => {}
                            }
                        }
                        retry.dirty.insert(Category::Model);
                    }
                    Origin::Label(slot) => {
                        if let Some(label) = state.labels.slot_mut(slot) {
                            label.changed = true;
                        }
                        retry.dirty.insert(Category::Labels);
                    }
                }
            }
            self.pending.lock().restore(retry);
        }
        self.reschedule();
        writes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::PendingChangeSet;
    use crate::state::{Label, Model, ReplayEntry, Role, Subnet};

    fn take(pending: &mut PendingChangeSet) -> TakenChanges {
        pending.take()
    }

    #[test]
    fn test_writes_follow_category_order() {
        let mut state = MeshState::default();
        state.valid = true;
        state.role = Some(Role::Node);
        state.replay.allocate(ReplayEntry::new(0x0010, 1, false)).unwrap();
        state.update_replay(0x0010, 2, false).unwrap();

        let mut pending = PendingChangeSet::new();
        pending.mark(Category::Role);
        pending.mark(Category::Seq);
        pending.mark(Category::Net);
        pending.mark(Category::Rpl);

        let writes = collect_writes(&mut state, &take(&mut pending));
        let keys: Vec<String> = writes.iter().map(|write| write.key.to_string()).collect();
        assert_eq!(keys, vec!["RPL/10", "Net", "Seq", "Role"]);
        assert!(!state.replay.find(0x0010).unwrap().store_pending);
    }

    #[test]
    fn test_invalid_state_clears_identity_records() {
        let mut state = MeshState::default();
        state.replay.allocate(ReplayEntry::new(0x0020, 1, false)).unwrap();

        let mut pending = PendingChangeSet::new();
        pending.mark(Category::Net);
        pending.mark(Category::Iv);
        pending.mark(Category::Cfg);
        pending.mark(Category::Rpl);

        let writes = collect_writes(&mut state, &take(&mut pending));
        assert!(writes.iter().all(|write| write.value.is_none()));
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[0].origin, Origin::Replay(0x0020));
        // Freed only after the delete succeeds
        assert_eq!(state.replay.len(), 1);
    }

    #[test]
    fn test_missing_key_is_skipped_and_clear_is_written() {
        let mut state = MeshState::default();
        state.subnets.allocate(Subnet::new(1, [1; 16])).unwrap();

        let mut pending = PendingChangeSet::new();
        pending.mark_key(KeyKind::Net, 1, UpdateOp::Store).unwrap();
        pending.mark_key(KeyKind::Net, 2, UpdateOp::Store).unwrap();
        pending.mark_key(KeyKind::App, 3, UpdateOp::Clear).unwrap();

        let writes = collect_writes(&mut state, &take(&mut pending));
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].key, RecordKey::NetKey(1));
        assert_eq!(writes[1], Write::delete(RecordKey::AppKey(3), writes[1].origin));
    }

    #[test]
    fn test_deleted_label_is_removed_from_storage() {
        let mut state = MeshState::default();
        let mut label = Label::new(0x8001, [9; 16]);
        label.ref_count = 0;
        label.changed = true;
        state.labels.put(2, label).unwrap();
        state.labels.put(0, Label::new(0x8002, [3; 16])).unwrap();

        let mut pending = PendingChangeSet::new();
        pending.mark(Category::Labels);

        let writes = collect_writes(&mut state, &take(&mut pending));
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].key, RecordKey::Label(2));
        assert!(writes[0].value.is_none());
        assert!(!state.labels.slot(2).unwrap().changed);
    }

    #[test]
    fn test_model_flags_are_consumed() {
        let mut model = Model::with_publication(ModelId::sig(0, 1));
        model.bind_pending = true;
        model.pub_pending = true;
        let mut state = MeshState::new(vec![model, Model::new(ModelId::sig(0, 2))]);

        let mut pending = PendingChangeSet::new();
        pending.mark(Category::Model);

        let writes = collect_writes(&mut state, &take(&mut pending));
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].key.to_string(), "s/1/bind");
        // Unassigned publication is written as zeros
        assert_eq!(writes[1].value.as_deref(), Some(&[0u8; records::PUB_LEN][..]));
        assert!(!state.models[0].has_pending());
    }
}
