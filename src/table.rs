//! Fixed-capacity slot tables
//!
//! Every associative structure the engine keeps (replay list, subnets, app
//! keys, labels, the node registry and the pending-update trackers) is a
//! [`SlotTable`]: an array of `N` slots, each either free or holding one
//! entry. Lookup and allocation are linear scans. The table never grows, so
//! running out of slots surfaces as an [`Exhausted`] error instead of an
//! allocation failure.

use crate::error::Exhausted;

/// An entry that is unique within its table by some identifier.
pub trait Slotted {
    /// Identifier type (source address, key index, ...)
    type Id: Copy + PartialEq;

    /// Identifier of this entry
    fn id(&self) -> Self::Id;
}

/// A table of `N` slots with explicit free tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTable<T, const N: usize> {
    name: &'static str,
    slots: [Option<T>; N],
}

impl<T, const N: usize> SlotTable<T, N> {
    /// Create an empty table. `name` is used in exhaustion errors and logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Compile-time capacity
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// True when no slot is occupied
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Entry stored in slot `index`, if any
    pub fn slot(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Mutable entry stored in slot `index`, if any
    pub fn slot_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Overwrite slot `index` directly. Used by tables addressed by slot id.
    pub fn put(&mut self, index: usize, value: T) -> Result<&mut T, Exhausted> {
        let exhausted = self.exhausted();
        let slot = self.slots.get_mut(index).ok_or(exhausted)?;
        Ok(slot.insert(value))
    }

    /// Mark slot `index` free, returning what it held
    pub fn free(&mut self, index: usize) -> Option<T> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    /// Claim the first free slot for `value`
    pub fn allocate(&mut self, value: T) -> Result<usize, Exhausted> {
        match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(value);
                Ok(index)
            }
            None => Err(self.exhausted()),
        }
    }

    /// Iterate over occupied slots with their indices
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (index, value)))
    }

    /// Iterate mutably over occupied slots with their indices
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_mut().map(|value| (index, value)))
    }

    /// Free every slot
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    fn exhausted(&self) -> Exhausted {
        Exhausted {
            table: self.name,
            capacity: N,
        }
    }
}

impl<T: Slotted, const N: usize> SlotTable<T, N> {
    /// Slot index holding `id`
    pub fn position(&self, id: T::Id) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|value| value.id() == id))
    }

    /// Entry with identifier `id`
    pub fn find(&self, id: T::Id) -> Option<&T> {
        self.position(id).and_then(|index| self.slot(index))
    }

    /// Mutable entry with identifier `id`
    pub fn find_mut(&mut self, id: T::Id) -> Option<&mut T> {
        let index = self.position(id)?;
        self.slot_mut(index)
    }

    /// Return the entry for `id`, allocating it with `make` if absent
    pub fn find_or_allocate(
        &mut self,
        id: T::Id,
        make: impl FnOnce() -> T,
    ) -> Result<&mut T, Exhausted> {
        let exhausted = self.exhausted();
        let index = match self.position(id) {
            Some(index) => index,
            None => self.allocate(make())?,
        };
        // The slot was occupied or just claimed above
        self.slot_mut(index).ok_or(exhausted)
    }

    /// Free the slot holding `id`
    pub fn remove(&mut self, id: T::Id) -> Option<T> {
        let index = self.position(id)?;
        self.free(index)
    }
}

impl<T, const N: usize> Default for SlotTable<T, N> {
    fn default() -> Self {
        Self::new("slot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Entry {
        id: u16,
        value: u32,
    }

    impl Slotted for Entry {
        type Id = u16;

        fn id(&self) -> u16 {
            self.id
        }
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let mut table: SlotTable<Entry, 2> = SlotTable::new("test");

        assert_eq!(table.allocate(Entry { id: 1, value: 10 }), Ok(0));
        assert_eq!(table.allocate(Entry { id: 2, value: 20 }), Ok(1));

        let err = table.allocate(Entry { id: 3, value: 30 }).unwrap_err();
        assert_eq!(err.table, "test");
        assert_eq!(err.capacity, 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_find_reuses_slot() {
        let mut table: SlotTable<Entry, 4> = SlotTable::new("test");

        table.find_or_allocate(7, || Entry { id: 7, value: 1 }).unwrap().value = 2;
        table.find_or_allocate(7, || Entry { id: 7, value: 1 }).unwrap().value += 1;

        assert_eq!(table.len(), 1);
        assert_eq!(table.find(7).map(|entry| entry.value), Some(3));
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let mut table: SlotTable<Entry, 2> = SlotTable::new("test");
        table.allocate(Entry { id: 1, value: 0 }).unwrap();
        table.allocate(Entry { id: 2, value: 0 }).unwrap();

        assert!(table.remove(1).is_some());
        assert!(table.find(1).is_none());
        assert_eq!(table.allocate(Entry { id: 3, value: 0 }), Ok(0));
        assert_eq!(table.position(3), Some(0));
    }

    #[test]
    fn test_put_addresses_slot_directly() {
        let mut table: SlotTable<u32, 3> = SlotTable::new("labels");

        table.put(2, 42).unwrap();
        assert_eq!(table.slot(2), Some(&42));
        assert_eq!(table.slot(0), None);
        assert!(table.put(3, 1).is_err());

        assert_eq!(table.iter().map(|(index, _)| index).collect::<Vec<_>>(), vec![2]);
        table.clear();
        assert!(table.is_empty());
    }
}
