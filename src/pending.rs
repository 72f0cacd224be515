//! Pending-change tracking
//!
//! A [`PendingChangeSet`] records what is owed to storage: a bitset of dirty
//! categories plus two bounded tables naming the individual keys and nodes to
//! store or clear. Repeated marks for the same id coalesce into one entry and
//! the last operation wins.

use crate::config::{KEY_UPDATE_COUNT, NODE_UPDATE_COUNT};
use crate::error::Exhausted;
use crate::table::{SlotTable, Slotted};
use tracing::warn;

/// A category of persisted state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Category {
    /// Primary address and device key
    Net = 1 << 0,
    /// IV index
    Iv = 1 << 1,
    /// Sequence number
    Seq = 1 << 2,
    /// Replay protection list
    Rpl = 1 << 3,
    /// Network and application keys
    Keys = 1 << 4,
    /// Heartbeat publication
    HbPub = 1 << 5,
    /// Configuration server state
    Cfg = 1 << 6,
    /// Model bindings, subscriptions and publication
    Model = 1 << 7,
    /// Virtual address labels
    Labels = 1 << 8,
    /// Operating role
    Role = 1 << 9,
    /// Provisioner's node registry
    Nodes = 1 << 10,
}

impl Category {
    /// Every category, in flush order
    pub const FLUSH_ORDER: [Category; 11] = [
        Category::Rpl,
        Category::Keys,
        Category::Net,
        Category::Iv,
        Category::Seq,
        Category::HbPub,
        Category::Cfg,
        Category::Model,
        Category::Labels,
        Category::Role,
        Category::Nodes,
    ];

    fn bit(self) -> u16 {
        self as u16
    }
}

/// A set of dirty categories
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtySet(u16);

impl DirtySet {
    /// No category dirty
    pub const EMPTY: DirtySet = DirtySet(0);

    /// Set containing exactly `categories`
    pub fn of(categories: &[Category]) -> Self {
        let mut set = Self::EMPTY;
        for category in categories {
            set.insert(*category);
        }
        set
    }

    /// Mark `category`
    pub fn insert(&mut self, category: Category) {
        self.0 |= category.bit();
    }

    /// Whether `category` is marked
    pub fn contains(self, category: Category) -> bool {
        self.0 & category.bit() != 0
    }

    /// Whether any of `categories` is marked
    pub fn contains_any(self, categories: &[Category]) -> bool {
        categories.iter().any(|category| self.contains(*category))
    }

    /// Union of both sets
    pub fn union(self, other: DirtySet) -> DirtySet {
        DirtySet(self.0 | other.0)
    }

    /// Nothing marked
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Marked categories in flush order
    pub fn iter(self) -> impl Iterator<Item = Category> {
        Category::FLUSH_ORDER
            .into_iter()
            .filter(move |category| self.contains(*category))
    }
}

/// Store or delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    /// Write the current value
    Store,
    /// Delete the record
    Clear,
}

/// Which key table a key update refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Network key (subnet)
    Net,
    /// Application key
    App,
}

/// Pending store or clear of one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUpdate {
    /// Key table
    pub kind: KeyKind,
    /// 12-bit key index
    pub idx: u16,
    /// Operation owed
    pub op: UpdateOp,
}

impl Slotted for KeyUpdate {
    type Id = (KeyKind, u16);

    fn id(&self) -> Self::Id {
        (self.kind, self.idx)
    }
}

/// Pending store or clear of one registry node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeUpdate {
    /// Primary address of the node
    pub addr: u16,
    /// Operation owed
    pub op: UpdateOp,
}

impl Slotted for NodeUpdate {
    type Id = u16;

    fn id(&self) -> u16 {
        self.addr
    }
}

/// Everything owed to storage that has not been flushed yet
#[derive(Debug, Clone, Default)]
pub struct PendingChangeSet {
    dirty: DirtySet,
    keys: SlotTable<KeyUpdate, KEY_UPDATE_COUNT>,
    nodes: SlotTable<NodeUpdate, NODE_UPDATE_COUNT>,
}

/// Work taken from a [`PendingChangeSet`] at the start of a flush pass
#[derive(Debug, Clone, Default)]
pub struct TakenChanges {
    /// Categories owed
    pub dirty: DirtySet,
    /// Key updates, in table order
    pub keys: Vec<KeyUpdate>,
    /// Node updates, in table order
    pub nodes: Vec<NodeUpdate>,
}

impl PendingChangeSet {
    /// Empty change set
    pub fn new() -> Self {
        Self {
            dirty: DirtySet::EMPTY,
            keys: SlotTable::new("key update"),
            nodes: SlotTable::new("node update"),
        }
    }

    /// Currently dirty categories
    pub fn dirty(&self) -> DirtySet {
        self.dirty
    }

    /// Mark a whole category dirty
    pub fn mark(&mut self, category: Category) {
        self.dirty.insert(category);
    }

    /// Record a key store or clear
    ///
    /// On exhaustion nothing is recorded and the caller must write through.
    pub fn mark_key(&mut self, kind: KeyKind, idx: u16, op: UpdateOp) -> Result<(), Exhausted> {
        let update = self
            .keys
            .find_or_allocate((kind, idx), || KeyUpdate { kind, idx, op })?;
        update.op = op;
        self.dirty.insert(Category::Keys);
        Ok(())
    }

    /// Record a node store or clear
    ///
    /// On exhaustion nothing is recorded and the caller must write through.
    pub fn mark_node(&mut self, addr: u16, op: UpdateOp) -> Result<(), Exhausted> {
        let update = self
            .nodes
            .find_or_allocate(addr, || NodeUpdate { addr, op })?;
        update.op = op;
        self.dirty.insert(Category::Nodes);
        Ok(())
    }

    /// Pending operation for a key, if any
    pub fn key_update(&self, kind: KeyKind, idx: u16) -> Option<UpdateOp> {
        self.keys.find((kind, idx)).map(|update| update.op)
    }

    /// Pending operation for a node, if any
    pub fn node_update(&self, addr: u16) -> Option<UpdateOp> {
        self.nodes.find(addr).map(|update| update.op)
    }

    /// Take everything pending, leaving the set empty
    ///
    /// The update tables are drained only when their category is dirty, which
    /// is always the case since marking an entry sets the category.
    pub fn take(&mut self) -> TakenChanges {
        let dirty = std::mem::take(&mut self.dirty);
        let keys = self.keys.iter().map(|(_, update)| *update).collect();
        let nodes = self.nodes.iter().map(|(_, update)| *update).collect();
        self.keys.clear();
        self.nodes.clear();
        TakenChanges { dirty, keys, nodes }
    }

    /// Put back work a failed pass could not complete
    ///
    /// Entries re-marked since the pass started are newer and win.
    pub fn restore(&mut self, changes: TakenChanges) {
        self.dirty = self.dirty.union(changes.dirty);
        for update in changes.keys {
            if self.keys.find((update.kind, update.idx)).is_none()
                && self.keys.allocate(update).is_err()
            {
                warn!(idx = update.idx, "key update table full, dropping retried change");
            }
        }
        for update in changes.nodes {
            if self.nodes.find(update.addr).is_none() && self.nodes.allocate(update).is_err() {
                warn!(addr = update.addr, "node update table full, dropping retried change");
            }
        }
    }

    /// Drop everything pending
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_marks_coalesce_last_op_wins() {
        let mut pending = PendingChangeSet::new();
        pending.mark_key(KeyKind::Net, 3, UpdateOp::Store).unwrap();
        pending.mark_key(KeyKind::Net, 3, UpdateOp::Clear).unwrap();
        pending.mark_key(KeyKind::App, 3, UpdateOp::Store).unwrap();

        assert_eq!(pending.key_update(KeyKind::Net, 3), Some(UpdateOp::Clear));
        assert_eq!(pending.key_update(KeyKind::App, 3), Some(UpdateOp::Store));
        assert!(pending.dirty().contains(Category::Keys));

        let taken = pending.take();
        assert_eq!(taken.keys.len(), 2);
        assert!(pending.dirty().is_empty());
        assert_eq!(pending.key_update(KeyKind::Net, 3), None);
    }

    #[test]
    fn test_key_table_exhaustion() {
        let mut pending = PendingChangeSet::new();
        for idx in 0..KEY_UPDATE_COUNT as u16 {
            pending.mark_key(KeyKind::App, idx, UpdateOp::Store).unwrap();
        }
        // Coalescing still works when full
        pending.mark_key(KeyKind::App, 0, UpdateOp::Clear).unwrap();

        let err = pending.mark_key(KeyKind::Net, 0, UpdateOp::Store).unwrap_err();
        assert_eq!(err.capacity, KEY_UPDATE_COUNT);
    }

    #[test]
    fn test_node_clear_is_recorded_as_clear() {
        let mut pending = PendingChangeSet::new();
        pending.mark_node(0x0100, UpdateOp::Clear).unwrap();
        assert_eq!(pending.node_update(0x0100), Some(UpdateOp::Clear));
        pending.mark_node(0x0100, UpdateOp::Store).unwrap();
        assert_eq!(pending.node_update(0x0100), Some(UpdateOp::Store));
    }

    #[test]
    fn test_restore_keeps_newer_marks() {
        let mut pending = PendingChangeSet::new();
        pending.mark_node(0x0100, UpdateOp::Store).unwrap();
        pending.mark(Category::Seq);
        let taken = pending.take();

        pending.mark_node(0x0100, UpdateOp::Clear).unwrap();
        pending.restore(taken);

        assert_eq!(pending.node_update(0x0100), Some(UpdateOp::Clear));
        assert!(pending.dirty().contains(Category::Seq));
        assert!(pending.dirty().contains(Category::Nodes));
    }

    #[test]
    fn test_dirty_set_iterates_in_flush_order() {
        let set = DirtySet::of(&[Category::Nodes, Category::Net, Category::Rpl]);
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![Category::Rpl, Category::Net, Category::Nodes]
        );
    }
}
