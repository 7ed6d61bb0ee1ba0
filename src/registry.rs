//! Object Registry (spec §4.3), ported from `object.c`/`object.h`.
//!
//! The original keeps one process-wide free list per entity kind plus a
//! per-kind "extra bytes" extension slot that generators/collectors grow at
//! startup. `slotmap::SlotMap` already gives us the free-list behavior (a
//! released slot's storage is reused on the next `insert`), so this module's
//! job narrows to reference counting and the `NEW`/`DESTROYED` event pair,
//! plus a typed extension-slot map per entity so collaborators can attach
//! private state without the core knowing its shape.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use slotmap::{Key, SecondaryMap};

/// Per-entity collaborator-private state, keyed by the attaching
/// collaborator's type. Mirrors `expand(kind, bytes) -> offset` generalized
/// to "attach a typed value instead of a byte range".
#[derive(Default)]
pub struct ExtensionSlots<K: Key> {
    slots: SecondaryMap<K, HashMap<TypeId, Box<dyn Any>>>,
}

impl<K: Key> ExtensionSlots<K> {
    pub fn new() -> Self {
        ExtensionSlots { slots: SecondaryMap::new() }
    }

    pub fn set<T: 'static>(&mut self, key: K, value: T) {
        self.slots.entry(key).unwrap().or_default().insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: 'static>(&self, key: K) -> Option<&T> {
        self.slots.get(key)?.get(&TypeId::of::<T>())?.downcast_ref()
    }

    pub fn get_mut<T: 'static>(&mut self, key: K) -> Option<&mut T> {
        self.slots.get_mut(key)?.get_mut(&TypeId::of::<T>())?.downcast_mut()
    }

    pub fn clear(&mut self, key: K) {
        self.slots.remove(key);
    }
}

/// A reference count attached to a registry entity. Entities start at 1 (the
/// creating generator's reference); `dec` to zero is terminal and must not
/// be resurrected (spec §3 invariant).
#[derive(Debug, Clone, Copy, Default)]
pub struct RefCount(u32);

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("reference count underflow: dec_ref called on an object with no references")]
pub struct RefCountUnderflowError;

impl RefCount {
    pub fn new() -> Self {
        RefCount(1)
    }

    pub fn inc(&mut self) {
        self.0 += 1;
    }

    /// Returns `true` once the count reaches zero, i.e. the object should be
    /// destroyed.
    pub fn dec(&mut self) -> Result<bool, RefCountUnderflowError> {
        if self.0 == 0 {
            return Err(RefCountUnderflowError);
        }
        self.0 -= 1;
        Ok(self.0 == 0)
    }

    pub fn count(&self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::{new_key_type, SlotMap};

    new_key_type! { struct K; }

    #[test]
    fn ref_count_reaches_zero_exactly_once() {
        let mut rc = RefCount::new();
        rc.inc();
        assert_eq!(rc.count(), 2);
        assert!(!rc.dec().unwrap());
        assert!(rc.dec().unwrap());
        assert!(rc.dec().is_err());
    }

    #[test]
    fn extension_slot_roundtrip() {
        let mut pool: SlotMap<K, ()> = SlotMap::with_key();
        let k = pool.insert(());
        let mut ext: ExtensionSlots<K> = ExtensionSlots::new();
        ext.set(k, "cookie-value".to_string());
        assert_eq!(ext.get::<String>(k).unwrap(), "cookie-value");
        ext.clear(k);
        assert!(ext.get::<String>(k).is_none());
    }
}
