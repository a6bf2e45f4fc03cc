//! Per-interface record of pre-modification hardware addresses

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct IdentityRecord {
    original: String,
    restored: bool,
}

/// Remembers the address each interface had before it was first modified.
///
/// While a record is active it is never overwritten. A successful restore
/// clears it: lookups treat it as absent, and the next modification
/// captures the address the interface has at that point.
#[derive(Debug, Default)]
pub struct IdentityStore {
    records: Mutex<BTreeMap<String, IdentityRecord>>,
}

impl IdentityStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, IdentityRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `address` as the original for `interface` unless an active
    /// record exists. Returns the address that is now on record.
    pub fn record_original(&self, interface: &str, address: &str) -> String {
        let mut records = self.records();
        let record = records
            .entry(interface.to_string())
            .or_insert_with(|| IdentityRecord {
                original: address.to_string(),
                restored: false,
            });
        if record.restored {
            record.original = address.to_string();
            record.restored = false;
        }
        record.original.clone()
    }

    /// Original address of an interface with an active record
    pub fn original(&self, interface: &str) -> Option<String> {
        self.records()
            .get(interface)
            .filter(|r| !r.restored)
            .map(|r| r.original.clone())
    }

    /// Make the record inert after a successful restore
    pub fn mark_restored(&self, interface: &str) {
        if let Some(record) = self.records().get_mut(interface) {
            record.restored = true;
        }
    }

    /// Interfaces with an active record, sorted by name
    pub fn recorded_interfaces(&self) -> Vec<String> {
        self.records()
            .iter()
            .filter(|(_, r)| !r.restored)
            .map(|(name, _)| name.clone())
            .collect()
    }
}
