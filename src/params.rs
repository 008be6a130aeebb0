//! Interning of parameter keys.
//!
//! Parameter sets refer to their keys by small integer ids so that the same key string is stored once per process.
//! A [`KeyInterner`] is the table behind those ids. It is constructed explicitly and shared with an [`Arc`]; every
//! rank that exchanges ids must agree on the table, which is why the interner is [`Serialize`]: rank 0 can build it
//! and [`broadcast()`](crate::transport::broadcast) it to the others.
//!
//! [`Arc`]: std::sync::Arc

use crate::serialization::{Mode, Serialize, Serializer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::trace;

/// Id of an interned key.
pub type KeyId = u32;

#[derive(Debug, Default)]
struct KeyTable {
    ids: HashMap<Arc<str>, KeyId>,
    keys: Vec<Arc<str>>,
}

impl KeyTable {
    fn insert(&mut self, key: &str) -> KeyId {
        if let Some(id) = self.ids.get(key) {
            return *id;
        }
        let id = self.keys.len() as KeyId;
        let key: Arc<str> = Arc::from(key);
        self.keys.push(key.clone());
        self.ids.insert(key, id);
        id
    }
}

/// Thread-safe two-way mapping between key strings and [`KeyId`]s.
///
/// Ids are assigned sequentially from zero in the order keys are first seen. Lookups take a shared lock; only the
/// first sighting of a key takes the exclusive one.
///
/// The interner also carries the process-wide switch that asks parameter consumers to verify every key they read
/// against the set they declared.
#[derive(Debug, Default)]
pub struct KeyInterner {
    table: RwLock<KeyTable>,
    verify: AtomicBool,
}

impl KeyInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of `key`, interning it if it has not been seen.
    ///
    /// # Panics
    ///
    /// Panics if the table's [`RwLock`] has been poisoned.
    pub fn intern(&self, key: &str) -> KeyId {
        if let Some(id) = self.id_of(key) {
            return id;
        }
        let id = self
            .table
            .write()
            .expect("key table lock should not have been poisoned")
            .insert(key);
        trace!(key, id, "interned parameter key");
        id
    }

    /// Id of `key` if it has been interned.
    ///
    /// # Panics
    ///
    /// Panics if the table's [`RwLock`] has been poisoned.
    pub fn id_of(&self, key: &str) -> Option<KeyId> {
        self.table
            .read()
            .expect("key table lock should not have been poisoned")
            .ids
            .get(key)
            .copied()
    }

    /// The key interned as `id`.
    ///
    /// # Panics
    ///
    /// Panics if the table's [`RwLock`] has been poisoned.
    pub fn resolve(&self, id: KeyId) -> Option<Arc<str>> {
        self.table
            .read()
            .expect("key table lock should not have been poisoned")
            .keys
            .get(id as usize)
            .cloned()
    }

    /// # Panics
    ///
    /// Panics if the table's [`RwLock`] has been poisoned.
    pub fn len(&self) -> usize {
        self.table
            .read()
            .expect("key table lock should not have been poisoned")
            .keys
            .len()
    }

    /// # Panics
    ///
    /// Panics if the table's [`RwLock`] has been poisoned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_verify(&self, enabled: bool) {
        self.verify.store(enabled, Ordering::Relaxed);
    }

    pub fn verify_enabled(&self) -> bool {
        self.verify.load(Ordering::Relaxed)
    }
}

impl Serialize for KeyInterner {
    /// Keys travel in id order; unpacking replaces the whole table.
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        let mut verify = self.verify_enabled();
        verify.serialize_order(ser)?;

        let table = self
            .table
            .get_mut()
            .expect("key table lock should not have been poisoned");
        let mut keys: Vec<String> = table.keys.iter().map(|key| key.to_string()).collect();
        keys.serialize_order(ser)?;

        if ser.mode() == Mode::Unpack {
            let mut rebuilt = KeyTable::default();
            for key in &keys {
                rebuilt.insert(key);
            }
            *table = rebuilt;
            self.set_verify(verify);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::{pack, unpack};
    use std::thread;

    #[test]
    fn interning_is_idempotent_and_reversible() {
        let keys = KeyInterner::new();
        let clock = keys.intern("clock");
        let latency = keys.intern("latency");
        assert_eq!(clock, keys.intern("clock"));
        assert_ne!(clock, latency);
        assert_eq!(Some(Arc::from("latency")), keys.resolve(latency));
        assert_eq!(None, keys.resolve(99));
        assert_eq!(None, keys.id_of("missing"));
        assert_eq!(2, keys.len());
    }

    #[test]
    fn concurrent_interning_agrees_on_ids() {
        let keys = KeyInterner::new();
        let ids: Vec<Vec<KeyId>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| ["a", "b", "c", "d"].iter().map(|key| keys.intern(key)).collect()))
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]), "threads saw different ids: {ids:?}");
        assert_eq!(4, keys.len());
    }

    #[test]
    fn table_and_verify_flag_travel_together() {
        let mut keys = KeyInterner::new();
        keys.intern("frequency");
        keys.intern("width");
        keys.set_verify(true);

        let copy: KeyInterner = unpack(&pack(&mut keys).unwrap()).unwrap();
        assert!(copy.verify_enabled());
        assert_eq!(Some(1), copy.id_of("width"));
        assert_eq!(Some(Arc::from("frequency")), copy.resolve(0));
    }
}
