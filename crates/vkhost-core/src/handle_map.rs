use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};
use vkhost_protocol::handle::{BoxedHandle, ObjectType};

use crate::error::CoreError;

/// Which function table a dispatchable object resolves its calls through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchLevel {
    Instance,
    Device,
}

/// Per-object function table, resolved once when the owning instance or
/// device is created and shared by every child dispatchable object.
/// `root` is the underlying driver handle the table was resolved against.
#[derive(Debug, PartialEq, Eq)]
pub struct DispatchTable {
    pub level: DispatchLevel,
    pub root: u64,
}

impl DispatchTable {
    pub fn new(level: DispatchLevel, root: u64) -> Arc<Self> {
        Arc::new(Self { level, root })
    }
}

/// What a boxed handle stands for.
#[derive(Debug, Clone)]
pub enum BoxedEntry {
    Dispatchable {
        underlying: u64,
        dispatch: Arc<DispatchTable>,
        /// Whether deleting this box releases `dispatch`
        owns_dispatch: bool,
    },
    NonDispatchable {
        underlying: u64,
    },
}

impl BoxedEntry {
    pub fn underlying(&self) -> u64 {
        match self {
            BoxedEntry::Dispatchable { underlying, .. } => *underlying,
            BoxedEntry::NonDispatchable { underlying } => *underlying,
        }
    }

    pub fn dispatch(&self) -> Option<&Arc<DispatchTable>> {
        match self {
            BoxedEntry::Dispatchable { dispatch, .. } => Some(dispatch),
            BoxedEntry::NonDispatchable { .. } => None,
        }
    }

    pub fn owns_dispatch(&self) -> bool {
        matches!(self, BoxedEntry::Dispatchable { owns_dispatch: true, .. })
    }
}

#[derive(Debug, Clone)]
struct Slot {
    object_type: ObjectType,
    entry: BoxedEntry,
}

/// Bidirectional mapping between guest-visible boxed handles and real driver
/// handles, for every object type.
///
/// Not internally synchronized: every access goes through the decoder's
/// global lock, which also covers the object graph.
pub struct HandleMap {
    /// Boxed handle -> underlying handle (+ dispatch info)
    boxed_to_entry: HashMap<BoxedHandle, Slot>,
    /// (type, underlying handle) -> boxed handle
    underlying_to_boxed: HashMap<(ObjectType, u64), BoxedHandle>,
    /// Counter for generating unique handle indices
    next_index: u64,
    /// Handle values to hand out, in order, instead of fresh ones while a
    /// snapshot is being loaded
    reserved: VecDeque<u64>,
    released_dispatch_tables: u64,
}

impl HandleMap {
    pub fn new() -> Self {
        Self {
            boxed_to_entry: HashMap::new(),
            underlying_to_boxed: HashMap::new(),
            // Start from 1 so a freshly composed handle is never null
            next_index: 1,
            reserved: VecDeque::new(),
            released_dispatch_tables: 0,
        }
    }

    /// Box a dispatchable object. Boxing an object that already has a box
    /// returns the existing one; the passed dispatch table is then dropped.
    pub fn new_boxed_dispatchable(
        &mut self,
        object_type: ObjectType,
        underlying: u64,
        dispatch: Arc<DispatchTable>,
        owns_dispatch: bool,
    ) -> BoxedHandle {
        debug_assert!(object_type.is_dispatchable());
        self.insert(
            object_type,
            BoxedEntry::Dispatchable {
                underlying,
                dispatch,
                owns_dispatch,
            },
        )
    }

    /// Box a non-dispatchable object (lookup-or-create).
    pub fn new_boxed_non_dispatchable(
        &mut self,
        object_type: ObjectType,
        underlying: u64,
    ) -> BoxedHandle {
        debug_assert!(!object_type.is_dispatchable());
        self.insert(object_type, BoxedEntry::NonDispatchable { underlying })
    }

    fn insert(&mut self, object_type: ObjectType, entry: BoxedEntry) -> BoxedHandle {
        let underlying = entry.underlying();
        if let Some(existing) = self.underlying_to_boxed.get(&(object_type, underlying)) {
            return *existing;
        }

        let boxed = self.alloc(object_type);
        self.boxed_to_entry.insert(boxed, Slot { object_type, entry });
        self.underlying_to_boxed.insert((object_type, underlying), boxed);
        boxed
    }

    fn alloc(&mut self, object_type: ObjectType) -> BoxedHandle {
        while let Some(raw) = self.reserved.pop_front() {
            let candidate = BoxedHandle(raw);
            if candidate.is_null() || self.boxed_to_entry.contains_key(&candidate) {
                warn!(
                    ?candidate,
                    ?object_type,
                    "reserved handle unusable (null or already live), skipping"
                );
                continue;
            }
            // Keep fresh allocations clear of pinned values.
            self.next_index = self.next_index.max(candidate.index() + 1);
            return candidate;
        }

        loop {
            let candidate = BoxedHandle::compose(object_type, self.next_index);
            self.next_index += 1;
            if !self.boxed_to_entry.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Look up the underlying handle. Unknown, null, or wrongly-typed handles
    /// yield `None`.
    pub fn unbox(&self, object_type: ObjectType, boxed: BoxedHandle) -> Option<u64> {
        if boxed.is_null() {
            return None;
        }
        self.boxed_to_entry
            .get(&boxed)
            .filter(|slot| slot.object_type == object_type)
            .map(|slot| slot.entry.underlying())
    }

    /// Like [`unbox`](Self::unbox), but reports a miss as an error.
    pub fn unbox_checked(
        &self,
        object_type: ObjectType,
        boxed: BoxedHandle,
    ) -> Result<u64, CoreError> {
        self.unbox(object_type, boxed)
            .ok_or_else(|| CoreError::HandleNotFound(format!("{:?} {:?}", object_type, boxed)))
    }

    /// Full entry for a boxed handle, with its recorded type.
    pub fn entry(&self, boxed: BoxedHandle) -> Option<(ObjectType, &BoxedEntry)> {
        self.boxed_to_entry
            .get(&boxed)
            .map(|slot| (slot.object_type, &slot.entry))
    }

    /// Reverse lookup: the current box for an underlying handle.
    pub fn unboxed_to_boxed(&self, object_type: ObjectType, underlying: u64) -> Option<BoxedHandle> {
        if underlying == 0 {
            return None;
        }
        self.underlying_to_boxed
            .get(&(object_type, underlying))
            .copied()
    }

    /// Dispatch table carried by a dispatchable boxed handle.
    pub fn dispatch(&self, boxed: BoxedHandle) -> Option<Arc<DispatchTable>> {
        self.boxed_to_entry
            .get(&boxed)
            .and_then(|slot| slot.entry.dispatch().cloned())
    }

    pub fn contains(&self, boxed: BoxedHandle) -> bool {
        self.boxed_to_entry.contains_key(&boxed)
    }

    /// Remove a boxed handle. Deleting an unknown handle is tolerated and
    /// reported through diagnostics; returns whether anything was removed.
    pub fn delete(&mut self, boxed: BoxedHandle) -> bool {
        let Some(slot) = self.boxed_to_entry.remove(&boxed) else {
            if !boxed.is_null() {
                warn!(?boxed, "delete of unknown boxed handle ignored");
            }
            return false;
        };

        let key = (slot.object_type, slot.entry.underlying());
        if self.underlying_to_boxed.get(&key) == Some(&boxed) {
            self.underlying_to_boxed.remove(&key);
        }

        if slot.entry.owns_dispatch() {
            self.released_dispatch_tables += 1;
            debug!(?boxed, "released owned dispatch table");
        }
        true
    }

    // ── Batch variants ─────────────────────────────────────────
    // Null slots map to null without a lookup.

    /// Boxed -> underlying in place. Unknown handles become 0.
    pub fn map_unbox(&self, object_type: ObjectType, handles: &mut [u64]) {
        for h in handles.iter_mut() {
            if *h != 0 {
                *h = self.unbox(object_type, BoxedHandle(*h)).unwrap_or(0);
            }
        }
    }

    /// Underlying -> existing boxed handle in place. Unboxed objects become 0.
    pub fn map_wrap(&self, object_type: ObjectType, handles: &mut [u64]) {
        for h in handles.iter_mut() {
            if *h != 0 {
                *h = self
                    .unboxed_to_boxed(object_type, *h)
                    .map(|b| b.raw())
                    .unwrap_or(0);
            }
        }
    }

    /// Underlying -> new (or existing) boxed handle in place.
    pub fn map_create(&mut self, object_type: ObjectType, handles: &mut [u64]) {
        for h in handles.iter_mut() {
            if *h != 0 {
                *h = self.new_boxed_non_dispatchable(object_type, *h).raw();
            }
        }
    }

    /// Delete every boxed handle in the slice.
    pub fn map_delete(&mut self, handles: &[u64]) {
        for h in handles.iter().filter(|h| **h != 0) {
            self.delete(BoxedHandle(*h));
        }
    }

    /// Boxed -> underlying in place, deleting each box after lookup.
    pub fn map_unbox_and_delete(&mut self, object_type: ObjectType, handles: &mut [u64]) {
        for h in handles.iter_mut() {
            if *h != 0 {
                let boxed = BoxedHandle(*h);
                *h = self.unbox(object_type, boxed).unwrap_or(0);
                self.delete(boxed);
            }
        }
    }

    // ── Snapshot load reservations ─────────────────────────────

    /// Queue handle values that subsequent box creations consume in order
    /// instead of allocating fresh ones. `buffer` holds a little-endian u32
    /// count followed by that many little-endian u64 handle values.
    /// Returns the number of bytes consumed.
    pub fn set_created_handles_for_snapshot_load(
        &mut self,
        buffer: &[u8],
    ) -> Result<usize, CoreError> {
        if buffer.len() < 4 {
            return Err(CoreError::MalformedHandleBuffer {
                needed: 4,
                available: buffer.len(),
            });
        }
        let count = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        let needed = 4 + count * 8;
        if buffer.len() < needed {
            return Err(CoreError::MalformedHandleBuffer {
                needed,
                available: buffer.len(),
            });
        }

        self.reserved.clear();
        for chunk in buffer[4..needed].chunks_exact(8) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            self.reserved.push_back(u64::from_le_bytes(raw));
        }
        debug!(count, "reserved handles for snapshot load");
        Ok(needed)
    }

    pub fn clear_created_handles_for_snapshot_load(&mut self) {
        if !self.reserved.is_empty() {
            debug!(unused = self.reserved.len(), "discarding reserved handles");
        }
        self.reserved.clear();
    }

    pub fn reserved_remaining(&self) -> usize {
        self.reserved.len()
    }

    // ── Introspection ──────────────────────────────────────────

    pub fn iter(&self) -> impl Iterator<Item = (BoxedHandle, ObjectType, &BoxedEntry)> {
        self.boxed_to_entry
            .iter()
            .map(|(boxed, slot)| (*boxed, slot.object_type, &slot.entry))
    }

    /// Return number of live boxed handles.
    pub fn len(&self) -> usize {
        self.boxed_to_entry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxed_to_entry.is_empty()
    }

    /// Number of dispatch tables released by deleting their owning boxes.
    pub fn released_dispatch_tables(&self) -> u64 {
        self.released_dispatch_tables
    }
}

impl Default for HandleMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode handle values in the layout accepted by
/// [`HandleMap::set_created_handles_for_snapshot_load`].
pub fn encode_created_handles(handles: &[BoxedHandle]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + handles.len() * 8);
    out.extend_from_slice(&(handles.len() as u32).to_le_bytes());
    for h in handles {
        out.extend_from_slice(&h.raw().to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn boxing_twice_returns_same_handle() {
        let mut map = HandleMap::new();
        let a = map.new_boxed_non_dispatchable(ObjectType::Buffer, 0xbeef);
        let b = map.new_boxed_non_dispatchable(ObjectType::Buffer, 0xbeef);
        assert_eq!(a, b);
        assert_eq!(map.len(), 1);
        assert_eq!(map.unbox(ObjectType::Buffer, a), Some(0xbeef));
    }

    #[test]
    fn same_underlying_different_type_gets_distinct_boxes() {
        let mut map = HandleMap::new();
        let a = map.new_boxed_non_dispatchable(ObjectType::Buffer, 7);
        let b = map.new_boxed_non_dispatchable(ObjectType::Image, 7);
        assert_ne!(a, b);
        assert_eq!(map.unbox(ObjectType::Image, a), None);
    }

    #[test]
    fn unbox_of_deleted_or_unknown_is_none() {
        let mut map = HandleMap::new();
        let h = map.new_boxed_non_dispatchable(ObjectType::Sampler, 3);
        assert!(map.delete(h));
        assert_eq!(map.unbox(ObjectType::Sampler, h), None);
        assert_eq!(map.unbox(ObjectType::Sampler, BoxedHandle(0x1234)), None);
        assert_eq!(map.unbox(ObjectType::Sampler, BoxedHandle::NULL), None);
        assert!(map.unbox_checked(ObjectType::Sampler, h).is_err());
    }

    #[test]
    fn double_delete_is_tolerated() {
        let mut map = HandleMap::new();
        let a = map.new_boxed_non_dispatchable(ObjectType::Fence, 1);
        let b = map.new_boxed_non_dispatchable(ObjectType::Fence, 2);
        assert!(map.delete(a));
        assert!(!map.delete(a));
        assert_eq!(map.unbox(ObjectType::Fence, b), Some(2));
    }

    #[test]
    fn owned_dispatch_released_only_by_owner() {
        let mut map = HandleMap::new();
        let table = DispatchTable::new(DispatchLevel::Device, 0x10);
        let device = map.new_boxed_dispatchable(ObjectType::Device, 0x10, table.clone(), true);
        let queue = map.new_boxed_dispatchable(ObjectType::Queue, 0x11, table.clone(), false);

        assert!(Arc::ptr_eq(&map.dispatch(queue).unwrap(), &table));
        map.delete(queue);
        assert_eq!(map.released_dispatch_tables(), 0);
        map.delete(device);
        assert_eq!(map.released_dispatch_tables(), 1);
    }

    #[test]
    fn reserved_handles_are_consumed_in_order() {
        let mut map = HandleMap::new();
        let wanted = [
            BoxedHandle::compose(ObjectType::Instance, 900),
            BoxedHandle::compose(ObjectType::Buffer, 901),
        ];
        let buf = encode_created_handles(&wanted);
        let mut padded = buf.clone();
        padded.extend_from_slice(&[0xaa; 3]);

        assert_eq!(map.set_created_handles_for_snapshot_load(&padded).unwrap(), buf.len());
        assert_eq!(map.reserved_remaining(), 2);

        let table = DispatchTable::new(DispatchLevel::Instance, 5);
        let inst = map.new_boxed_dispatchable(ObjectType::Instance, 5, table, true);
        let buffer = map.new_boxed_non_dispatchable(ObjectType::Buffer, 6);
        assert_eq!([inst, buffer], wanted);

        // Fresh allocations never collide with pinned values.
        let fresh = map.new_boxed_non_dispatchable(ObjectType::Buffer, 7);
        assert!(fresh.index() > 901);
    }

    #[test]
    fn reservation_not_consumed_by_existing_object() {
        let mut map = HandleMap::new();
        let first = map.new_boxed_non_dispatchable(ObjectType::Image, 1);
        map.set_created_handles_for_snapshot_load(&encode_created_handles(&[BoxedHandle(
            0x77,
        )]))
        .unwrap();
        assert_eq!(map.new_boxed_non_dispatchable(ObjectType::Image, 1), first);
        assert_eq!(map.reserved_remaining(), 1);
        map.clear_created_handles_for_snapshot_load();
        assert_eq!(map.reserved_remaining(), 0);
    }

    #[test]
    fn truncated_reservation_buffer_is_rejected() {
        let mut map = HandleMap::new();
        let mut buf = encode_created_handles(&[BoxedHandle(1), BoxedHandle(2)]);
        buf.truncate(10);
        assert!(matches!(
            map.set_created_handles_for_snapshot_load(&buf),
            Err(CoreError::MalformedHandleBuffer { needed: 20, available: 10 })
        ));
    }

    #[test]
    fn batch_mappings_skip_null_slots() {
        let mut map = HandleMap::new();
        let mut slots = [0u64, 0x40, 0x41];
        map.map_create(ObjectType::Semaphore, &mut slots);
        assert_eq!(slots[0], 0);
        let boxed = slots;

        let mut unboxed = boxed;
        map.map_unbox(ObjectType::Semaphore, &mut unboxed);
        assert_eq!(unboxed, [0, 0x40, 0x41]);

        let mut rewrapped = unboxed;
        map.map_wrap(ObjectType::Semaphore, &mut rewrapped);
        assert_eq!(rewrapped, boxed);

        let mut deleted = boxed;
        map.map_unbox_and_delete(ObjectType::Semaphore, &mut deleted);
        assert_eq!(deleted, [0, 0x40, 0x41]);
        assert!(map.is_empty());
    }

    proptest! {
        #[test]
        fn unbox_inverts_box(underlyings in proptest::collection::hash_set(1u64..u64::MAX, 1..64)) {
            let mut map = HandleMap::new();
            for u in &underlyings {
                let boxed = map.new_boxed_non_dispatchable(ObjectType::DeviceMemory, *u);
                prop_assert_eq!(map.unbox(ObjectType::DeviceMemory, boxed), Some(*u));
                prop_assert_eq!(map.new_boxed_non_dispatchable(ObjectType::DeviceMemory, *u), boxed);
                prop_assert_eq!(map.unboxed_to_boxed(ObjectType::DeviceMemory, *u), Some(boxed));
            }
            prop_assert_eq!(map.len(), underlyings.len());
        }

        #[test]
        fn deleted_handles_never_resolve(count in 1usize..32, delete_mask in any::<u32>()) {
            let mut map = HandleMap::new();
            let handles: Vec<_> = (0..count)
                .map(|i| map.new_boxed_non_dispatchable(ObjectType::Buffer, i as u64 + 1))
                .collect();
            for (i, h) in handles.iter().enumerate() {
                if delete_mask & (1 << i) != 0 {
                    map.delete(*h);
                }
            }
            for (i, h) in handles.iter().enumerate() {
                let expect = if delete_mask & (1 << i) != 0 { None } else { Some(i as u64 + 1) };
                prop_assert_eq!(map.unbox(ObjectType::Buffer, *h), expect);
            }
        }
    }
}
