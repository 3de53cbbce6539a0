//! Participant records and routing decisions.
//!
//! The registry is plain owned data with no locking and no I/O. The directory
//! wraps it in a single mutex; everything here can be tested synchronously.

use std::collections::{BTreeMap, btree_map::Entry};

use crate::transport::PeerAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
}

/// One registered name. `address` is only meaningful while online.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRecord {
    pub name: String,
    pub address: PeerAddress,
    pub presence: Presence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    NameTaken,
}

/// Where a message for a given target should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Deliver(PeerAddress),
    Offline,
    NotFound,
}

/// Name-keyed participant records.
///
/// A name stays taken from registration until it is explicitly deleted;
/// leaving only flips presence to offline.
#[derive(Debug, Default)]
pub struct Registry {
    records: BTreeMap<String, ParticipantRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new online record, or rejects the name if any record exists
    /// for it, online or offline. A rejected call never touches the existing
    /// record.
    pub fn register(&mut self, name: &str, address: PeerAddress) -> RegisterOutcome {
        match self.records.entry(name.to_string()) {
            Entry::Occupied(_) => RegisterOutcome::NameTaken,
            Entry::Vacant(slot) => {
                slot.insert(ParticipantRecord {
                    name: name.to_string(),
                    address,
                    presence: Presence::Online,
                });
                RegisterOutcome::Registered
            }
        }
    }

    pub fn route(&self, target: &str) -> Route {
        match self.records.get(target) {
            None => Route::NotFound,
            Some(record) if record.presence == Presence::Offline => Route::Offline,
            Some(record) => Route::Deliver(record.address.clone()),
        }
    }

    /// Marks `name` offline. Returns `false` if no such record exists.
    pub fn leave(&mut self, name: &str) -> bool {
        match self.records.get_mut(name) {
            Some(record) => {
                record.presence = Presence::Offline;
                true
            }
            None => false,
        }
    }

    /// Removes `name` entirely. Deleting an unknown name is a no-op.
    pub fn delete(&mut self, name: &str) -> bool {
        self.records.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&ParticipantRecord> {
        self.records.get(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
