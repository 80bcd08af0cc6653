//! Typed entity store: the authoritative derived-state view.
//!
//! The store is a set of per-kind ordered maps with load / create / save
//! semantics. Lookups return `Option` — absence is a value, not an error —
//! and every save is immediately visible to the next load. There is no
//! cross-entity transactionality; handlers order their writes so a replay
//! from the last persisted snapshot never violates a single entity's own
//! invariants.
//!
//! Persistence is a whole-store JSON snapshot written atomically (temp
//! file + rename), so a crash mid-write never leaves a torn state file.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smartaccount::{Account, EntityId, Factory, StoreError, Transaction, TransactionId};

/// A record kind the store can hold.
///
/// Implementations pick their collection inside [`EntityStore`] and carry
/// the consistency checks enforced on every write.
pub trait Entity: Clone + Serialize + DeserializeOwned {
    /// Kind name used in errors and logs.
    const KIND: &'static str;

    /// Key type the record is indexed by.
    type Key: Ord + Clone + fmt::Display;

    /// The record's key.
    fn key(&self) -> &Self::Key;

    /// Consistency checks run on every save.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] when a required relationship
    /// does not hold.
    fn validate(&self) -> Result<(), StoreError>;

    /// The kind's collection within the store.
    fn collection(store: &EntityStore) -> &BTreeMap<Self::Key, Self>;

    /// Mutable access to the kind's collection.
    fn collection_mut(store: &mut EntityStore) -> &mut BTreeMap<Self::Key, Self>;
}

impl Entity for Factory {
    const KIND: &'static str = "factory";
    type Key = EntityId;

    fn key(&self) -> &EntityId {
        &self.id
    }

    fn validate(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn collection(store: &EntityStore) -> &BTreeMap<EntityId, Self> {
        &store.factories
    }

    fn collection_mut(store: &mut EntityStore) -> &mut BTreeMap<EntityId, Self> {
        &mut store.factories
    }
}

impl Entity for Account {
    const KIND: &'static str = "account";
    type Key = EntityId;

    fn key(&self) -> &EntityId {
        &self.id
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.factory == self.id {
            return Err(StoreError::Validation {
                kind: Self::KIND,
                reason: format!("account {} cannot be its own factory", self.id),
            });
        }
        Ok(())
    }

    fn collection(store: &EntityStore) -> &BTreeMap<EntityId, Self> {
        &store.accounts
    }

    fn collection_mut(store: &mut EntityStore) -> &mut BTreeMap<EntityId, Self> {
        &mut store.accounts
    }
}

impl Entity for Transaction {
    const KIND: &'static str = "transaction";
    type Key = TransactionId;

    fn key(&self) -> &TransactionId {
        &self.id
    }

    fn validate(&self) -> Result<(), StoreError> {
        if !self.id.derives_from(self.transaction_hash) {
            return Err(StoreError::Validation {
                kind: Self::KIND,
                reason: format!(
                    "id {} does not derive from transaction hash {:#x}",
                    self.id, self.transaction_hash
                ),
            });
        }
        Ok(())
    }

    fn collection(store: &EntityStore) -> &BTreeMap<TransactionId, Self> {
        &store.transactions
    }

    fn collection_mut(store: &mut EntityStore) -> &mut BTreeMap<TransactionId, Self> {
        &mut store.transactions
    }
}

/// In-memory derived-state store with JSON snapshot persistence.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStore {
    #[serde(default)]
    factories: BTreeMap<EntityId, Factory>,

    #[serde(default)]
    accounts: BTreeMap<EntityId, Account>,

    #[serde(default)]
    transactions: BTreeMap<TransactionId, Transaction>,
}

impl EntityStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a record by key. Absence is `None`, never an error.
    #[must_use]
    pub fn load<E: Entity>(&self, key: &E::Key) -> Option<E> {
        E::collection(self).get(key).cloned()
    }

    /// Upsert a record by key, replacing the whole record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] when the record fails its
    /// consistency checks; nothing is written in that case.
    pub fn save<E: Entity>(&mut self, record: E) -> Result<(), StoreError> {
        record.validate()?;
        let key = record.key().clone();
        E::collection_mut(self).insert(key, record);
        Ok(())
    }

    /// Insert a record that must not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] on key collision, or
    /// [`StoreError::Validation`] when the record fails its checks.
    pub fn create<E: Entity>(&mut self, record: E) -> Result<(), StoreError> {
        record.validate()?;
        if E::collection(self).contains_key(record.key()) {
            return Err(StoreError::Duplicate {
                kind: E::KIND,
                id: record.key().to_string(),
            });
        }
        let key = record.key().clone();
        E::collection_mut(self).insert(key, record);
        Ok(())
    }

    /// Number of records of a kind.
    #[must_use]
    pub fn count<E: Entity>(&self) -> usize {
        E::collection(self).len()
    }

    /// Iterate records of a kind in key order.
    pub fn iter<'a, E: Entity + 'a>(&'a self) -> impl Iterator<Item = &'a E>
    where
        <E as Entity>::Key: 'a,
    {
        E::collection(self).values()
    }
}

/// Read a JSON value from `path`. Returns `None` when the file is absent.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] when the file exists but cannot be
/// read or parsed.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| StoreError::unavailable(format!("reading {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| StoreError::unavailable(format!("parsing {}: {e}", path.display())))
}

/// Write a JSON value to `path` atomically (temp file + rename).
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] on any I/O failure.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::unavailable(format!("creating {}: {e}", parent.display())))?;
    }

    let tmp = path.with_extension("json.tmp");
    let text = serde_json::to_string_pretty(value).map_err(StoreError::unavailable)?;
    std::fs::write(&tmp, text.as_bytes())
        .map_err(|e| StoreError::unavailable(format!("writing {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        StoreError::unavailable(format!(
            "renaming {} to {}: {e}",
            tmp.display(),
            path.display()
        ))
    })?;

    Ok(())
}
