use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tracing::debug;

use crate::error::{ProtoError, Result};
use crate::handle::Handle;

/// Anything stored in a [`HandleTable`] is looked up by label as well as handle.
pub trait Labeled {
    fn label(&self) -> &str;
}

/// Check a label is usable: non-empty and free of whitespace.
pub fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(ProtoError::InvalidArgument("label is empty".to_string()));
    }
    if label.chars().any(char::is_whitespace) {
        return Err(ProtoError::InvalidArgument(format!(
            "label '{label}' contains whitespace"
        )));
    }
    Ok(())
}

/// Configuration for a handle table.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// First handle value issued.
    pub first_handle: Handle,
    /// Slots allocated up front; storage doubles when they run out.
    pub initial_capacity: usize,
    /// Reject a registration whose label is already present.
    pub unique_labels: bool,
}

impl TableConfig {
    pub fn params() -> Self {
        Self::default()
    }

    pub fn io_types() -> Self {
        Self {
            first_handle: Handle::FIRST_IO_TYPE,
            initial_capacity: 20,
            ..Self::default()
        }
    }

    pub fn chk_types() -> Self {
        Self {
            first_handle: Handle::FIRST_CHK_TYPE,
            initial_capacity: 20,
            ..Self::default()
        }
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            first_handle: Handle::FIRST_PARAM,
            initial_capacity: 40,
            unique_labels: true,
        }
    }
}

struct Slot<T> {
    handle: Handle,
    entry: T,
}

/// Growable registry that hands out stable handles.
///
/// Entries live in a slot array. Removing an entry frees its slot, and the
/// lowest free slot is reused by the next registration, but the handle it
/// carried is retired for good. A handle-to-slot map keeps lookups O(1).
pub struct HandleTable<T> {
    slots: Vec<Option<Slot<T>>>,
    index: HashMap<Handle, usize>,
    free: BinaryHeap<Reverse<usize>>,
    next_handle: Handle,
    config: TableConfig,
}

impl<T: Labeled> HandleTable<T> {
    pub fn new() -> Self {
        Self::with_config(TableConfig::default())
    }

    pub fn with_config(config: TableConfig) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(config.initial_capacity, || None);
        let free = (0..config.initial_capacity).map(Reverse).collect();
        Self {
            slots,
            index: HashMap::new(),
            free,
            next_handle: config.first_handle,
            config,
        }
    }

    /// Store `entry` under a freshly allocated handle.
    ///
    /// Fails with `InvalidArgument` for an unusable label, `DuplicateLabel`
    /// when labels must be unique and this one is taken, and `Capacity` if
    /// storage cannot grow. The table is unchanged on failure.
    pub fn register(&mut self, entry: T) -> Result<Handle> {
        validate_label(entry.label())?;
        if self.config.unique_labels && self.handle_of(entry.label()).is_some() {
            return Err(ProtoError::DuplicateLabel(entry.label().to_string()));
        }

        let slot = self.take_free_slot()?;
        let handle = self.next_handle;
        self.next_handle = handle.next();

        debug!(%handle, label = entry.label(), slot, "registered entry");
        self.slots[slot] = Some(Slot { handle, entry });
        self.index.insert(handle, slot);
        Ok(handle)
    }

    /// Store `entry` under a handle chosen elsewhere, replacing any entry
    /// that already has it.
    ///
    /// This is how a steerer mirrors the application's tables: redelivered
    /// definitions overwrite rather than duplicate. Returns the replaced entry.
    pub fn upsert(&mut self, handle: Handle, entry: T) -> Result<Option<T>> {
        if !handle.is_set() {
            return Err(ProtoError::InvalidArgument(format!(
                "cannot store entry '{}' under unset handle",
                entry.label()
            )));
        }
        validate_label(entry.label())?;
        if self.config.unique_labels {
            if let Some(other) = self.handle_of(entry.label()) {
                if other != handle {
                    return Err(ProtoError::DuplicateLabel(entry.label().to_string()));
                }
            }
        }

        if let Some(&slot) = self.index.get(&handle) {
            let previous = self.slots[slot].replace(Slot { handle, entry });
            return Ok(previous.map(|s| s.entry));
        }

        let slot = self.take_free_slot()?;
        self.slots[slot] = Some(Slot { handle, entry });
        self.index.insert(handle, slot);
        if handle >= self.next_handle {
            self.next_handle = handle.next();
        }
        Ok(None)
    }

    /// Look up an entry; stale and unknown handles give `NotFound`.
    pub fn get(&self, handle: Handle) -> Result<&T> {
        self.index
            .get(&handle)
            .and_then(|&slot| self.slots[slot].as_ref())
            .map(|s| &s.entry)
            .ok_or(ProtoError::NotFound(handle))
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T> {
        match self.index.get(&handle) {
            Some(&slot) => self.slots[slot]
                .as_mut()
                .map(|s| &mut s.entry)
                .ok_or(ProtoError::NotFound(handle)),
            None => Err(ProtoError::NotFound(handle)),
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.index.contains_key(&handle)
    }

    /// Remove an entry, freeing its slot. Other handles are untouched.
    pub fn remove(&mut self, handle: Handle) -> Result<T> {
        let slot = self
            .index
            .remove(&handle)
            .ok_or(ProtoError::NotFound(handle))?;
        let removed = self.slots[slot].take().ok_or(ProtoError::NotFound(handle))?;
        self.free.push(Reverse(slot));
        debug!(%handle, label = removed.entry.label(), slot, "removed entry");
        Ok(removed.entry)
    }

    pub fn find_by_label(&self, label: &str) -> Option<(Handle, &T)> {
        self.iter().find(|(_, entry)| entry.label() == label)
    }

    pub fn handle_of(&self, label: &str) -> Option<Handle> {
        self.find_by_label(label).map(|(handle, _)| handle)
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.as_ref().map(|s| (s.handle, &s.entry)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.as_mut().map(|s| (s.handle, &mut s.entry)))
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Allocated slots, live or free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The handle the next `register` will issue.
    pub fn next_handle(&self) -> Handle {
        self.next_handle
    }

    /// Drop every entry. Issued handles stay retired.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.index.clear();
        self.free = (0..self.slots.len()).map(Reverse).collect();
    }

    fn take_free_slot(&mut self) -> Result<usize> {
        if let Some(Reverse(slot)) = self.free.pop() {
            return Ok(slot);
        }

        let old = self.slots.len();
        let new_cap = old.saturating_mul(2).max(self.config.initial_capacity).max(1);
        self.slots
            .try_reserve_exact(new_cap - old)
            .map_err(|_| ProtoError::Capacity(new_cap))?;
        self.slots.resize_with(new_cap, || None);
        self.free.extend((old + 1..new_cap).map(Reverse));
        debug!(from = old, to = new_cap, "grew handle table");
        Ok(old)
    }
}

impl<T: Labeled> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Labeled> std::fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("next_handle", &self.next_handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Named {
        label: String,
        value: u32,
    }

    impl Named {
        fn new(label: &str, value: u32) -> Self {
            Self {
                label: label.to_string(),
                value,
            }
        }
    }

    impl Labeled for Named {
        fn label(&self) -> &str {
            &self.label
        }
    }

    fn small() -> HandleTable<Named> {
        HandleTable::with_config(TableConfig {
            initial_capacity: 2,
            ..TableConfig::default()
        })
    }

    #[test]
    fn register_assigns_sequential_handles() {
        let mut table = small();
        let a = table.register(Named::new("TEMP", 1)).unwrap();
        let b = table.register(Named::new("PRESSURE", 2)).unwrap();

        assert_eq!(a, Handle::new(0));
        assert_eq!(b, Handle::new(1));
        assert_eq!(table.get(b).unwrap().value, 2);
    }

    #[test]
    fn duplicate_label_leaves_table_unchanged() {
        let mut table = small();
        let first = table.register(Named::new("TEMP", 1)).unwrap();

        let err = table.register(Named::new("TEMP", 99)).unwrap_err();
        assert!(matches!(err, ProtoError::DuplicateLabel(ref l) if l == "TEMP"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(first).unwrap().value, 1);
        assert_eq!(table.next_handle(), Handle::new(1));
    }

    #[test]
    fn whitespace_label_rejected() {
        let mut table = small();
        assert!(matches!(
            table.register(Named::new("two words", 0)),
            Err(ProtoError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.register(Named::new("", 0)),
            Err(ProtoError::InvalidArgument(_))
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn grows_when_full_and_keeps_handles() {
        let mut table = small();
        let handles: Vec<_> = (0..9)
            .map(|i| table.register(Named::new(&format!("P{i}"), i)).unwrap())
            .collect();

        assert!(table.capacity() >= 9);
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(table.get(*handle).unwrap().value, i as u32);
        }
    }

    #[test]
    fn removed_slot_reused_with_fresh_handle() {
        let mut table = small();
        let a = table.register(Named::new("A", 0)).unwrap();
        let _b = table.register(Named::new("B", 1)).unwrap();
        let capacity = table.capacity();

        table.remove(a).unwrap();
        let c = table.register(Named::new("C", 2)).unwrap();

        assert_eq!(table.capacity(), capacity, "slot reused, no growth");
        assert_ne!(c, a);
        assert_eq!(c, Handle::new(2));
        assert!(matches!(table.get(a), Err(ProtoError::NotFound(_))));
        assert_eq!(table.iter().next().unwrap().0, c, "C sits in A's old slot");
    }

    #[test]
    fn removing_unknown_handle_is_not_found() {
        let mut table = small();
        assert!(matches!(
            table.remove(Handle::new(7)),
            Err(ProtoError::NotFound(h)) if h == Handle::new(7)
        ));
        assert!(matches!(
            table.get(Handle::NOT_SET),
            Err(ProtoError::NotFound(_))
        ));
    }

    #[test]
    fn upsert_overwrites_matching_handle() {
        let mut table = small();
        assert!(table
            .upsert(Handle::new(5), Named::new("TEMP", 1))
            .unwrap()
            .is_none());
        let previous = table.upsert(Handle::new(5), Named::new("TEMP", 2)).unwrap();

        assert_eq!(previous.unwrap().value, 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(Handle::new(5)).unwrap().value, 2);
        assert_eq!(table.next_handle(), Handle::new(6));
    }

    #[test]
    fn upsert_rejects_label_owned_by_other_handle() {
        let mut table = small();
        table.upsert(Handle::new(1), Named::new("TEMP", 1)).unwrap();
        assert!(matches!(
            table.upsert(Handle::new(2), Named::new("TEMP", 2)),
            Err(ProtoError::DuplicateLabel(_))
        ));
        assert!(matches!(
            table.upsert(Handle::NOT_SET, Named::new("X", 2)),
            Err(ProtoError::InvalidArgument(_))
        ));
    }

    #[test]
    fn non_unique_tables_accept_repeated_labels() {
        let mut table: HandleTable<Named> = HandleTable::with_config(TableConfig {
            unique_labels: false,
            ..TableConfig::default()
        });
        table.register(Named::new("SAME", 1)).unwrap();
        table.register(Named::new("SAME", 2)).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn io_and_chk_tables_start_at_offsets() {
        let mut io: HandleTable<Named> = HandleTable::with_config(TableConfig::io_types());
        let mut chk: HandleTable<Named> = HandleTable::with_config(TableConfig::chk_types());
        assert_eq!(io.register(Named::new("VIS", 0)).unwrap(), Handle::new(1000));
        assert_eq!(chk.register(Named::new("RESTART", 0)).unwrap(), Handle::new(2000));
    }

    #[test]
    fn clear_retires_handles() {
        let mut table = small();
        table.register(Named::new("A", 0)).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.register(Named::new("A", 0)).unwrap(), Handle::new(1));
    }

    proptest! {
        #[test]
        fn unique_registrations_get_unique_handles(
            labels in proptest::collection::hash_set("[A-Za-z_][A-Za-z0-9_]{0,8}", 0..64)
        ) {
            let mut table = small();
            let mut issued = Vec::new();
            for (i, label) in labels.iter().enumerate() {
                let handle = table.register(Named::new(label, i as u32)).unwrap();
                issued.push((handle, label.clone(), i as u32));
            }

            let mut seen = std::collections::HashSet::new();
            for (handle, label, value) in &issued {
                prop_assert!(seen.insert(*handle));
                let entry = table.get(*handle).unwrap();
                prop_assert_eq!(&entry.label, label);
                prop_assert_eq!(entry.value, *value);
            }
            prop_assert_eq!(table.len(), labels.len());
        }

        #[test]
        fn handles_never_reissued_after_removal(
            ops in proptest::collection::vec(any::<bool>(), 1..80)
        ) {
            let mut table = small();
            let mut live: Vec<Handle> = Vec::new();
            let mut ever = std::collections::HashSet::new();
            for (i, add) in ops.into_iter().enumerate() {
                if add || live.is_empty() {
                    let handle = table.register(Named::new(&format!("L{i}"), 0)).unwrap();
                    prop_assert!(ever.insert(handle));
                    live.push(handle);
                } else {
                    let handle = live.remove(i % live.len());
                    table.remove(handle).unwrap();
                }
            }
            prop_assert_eq!(table.len(), live.len());
        }
    }
}
