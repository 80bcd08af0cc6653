//! Event dispatch and the factory / account handlers.
//!
//! [`Indexer`] consumes [`EventEnvelope`]s one at a time, in the total
//! order established by the event source, and maps each `(source class,
//! event kind)` pair to its handler. Handlers read and write the entity
//! store and may register new account sources; they never call back into
//! the event source.
//!
//! Delivery is at-least-once, so every handler guards against redelivery
//! before mutating anything: a duplicate `AccountCreated` touches neither
//! the factory counter nor the account record, and a duplicate
//! `TransactionExecuted` leaves the first-written transaction in place.
//! Events that cannot be routed — unknown source, or an event class the
//! source does not emit — are dropped with a counter, never a fault.

use std::path::Path;

use alloy::primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use smartaccount::{
    Account, EntityId, EventEnvelope, EventPayload, Factory, StoreError, Transaction,
    TransactionId,
};
use tracing::{debug, warn};

use crate::registry::{SourceKind, SourceRegistry};
use crate::store::{self, EntityStore};

/// What dispatching a single event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A new account record was created.
    AccountCreated {
        /// The deployed account address.
        account: Address,
        /// Whether this call newly registered the account as a source.
        newly_registered: bool,
    },

    /// A transaction record was appended to an account's history.
    TransactionRecorded {
        /// Id of the new transaction record.
        id: TransactionId,
    },

    /// An account record gained its owner (or was created by a deferred
    /// initialization flow).
    AccountInitialized {
        /// The initialized account address.
        account: Address,
    },

    /// Redelivery of an already-processed event; nothing was mutated.
    Duplicate,

    /// The event was not routable; nothing was mutated.
    Dropped(DropReason),
}

/// Why an event was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The source address is neither the factory nor a registered account.
    UnknownSource,
    /// The source is registered but does not emit this event class.
    UnroutableEvent,
    /// An execution event arrived for a source with no account record.
    MissingAccount,
}

/// Observability counters, persisted with the state snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerStats {
    /// Events that mutated the store.
    pub applied: u64,
    /// Redelivered `AccountCreated` events ignored by the guard.
    pub duplicate_creations: u64,
    /// Redelivered `TransactionExecuted` events ignored by the guard.
    pub duplicate_transactions: u64,
    /// Initialization events for accounts whose owner was already set.
    pub duplicate_initializations: u64,
    /// Events dropped because their source was never registered.
    pub dropped_unknown_source: u64,
    /// Events dropped because the source does not emit that event class.
    pub dropped_unroutable: u64,
    /// Execution events dropped because no account record existed yet.
    pub dropped_missing_account: u64,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    store: &'a EntityStore,
    stats: &'a IndexerStats,
}

#[derive(Deserialize)]
struct Snapshot {
    store: EntityStore,
    #[serde(default)]
    stats: IndexerStats,
}

/// Single-threaded event-to-entity mapping core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indexer {
    store: EntityStore,
    registry: SourceRegistry,
    stats: IndexerStats,
}

impl Indexer {
    /// An empty indexer listening to `factory`.
    #[must_use]
    pub fn new(factory: Address) -> Self {
        Self {
            store: EntityStore::new(),
            registry: SourceRegistry::new(factory),
            stats: IndexerStats::default(),
        }
    }

    /// Route one event to its handler and apply it to the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] when a record the event implies
    /// cannot be written consistently. The event is then considered
    /// unprocessed; redelivery is owned by the event source. Duplicates
    /// are not errors — they resolve to [`Outcome::Duplicate`].
    pub fn dispatch(&mut self, event: &EventEnvelope) -> Result<Outcome, StoreError> {
        let Some(kind) = self.registry.route(event.source) else {
            self.stats.dropped_unknown_source += 1;
            warn!(
                source = %event.source,
                event = event.payload.name(),
                "dropping event from unknown source"
            );
            return Ok(Outcome::Dropped(DropReason::UnknownSource));
        };

        let outcome = match (kind, &event.payload) {
            (SourceKind::Factory, EventPayload::AccountCreated { account, owner }) => {
                self.handle_account_created(event, *account, *owner)?
            }
            (
                SourceKind::Account,
                EventPayload::TransactionExecuted {
                    target,
                    value,
                    data,
                },
            ) => self.handle_transaction_executed(event, *target, *value, data.clone())?,
            (SourceKind::Account, EventPayload::AccountInitialized { owner }) => {
                self.handle_account_initialized(event, *owner)?
            }
            _ => {
                self.stats.dropped_unroutable += 1;
                warn!(
                    source = %event.source,
                    event = event.payload.name(),
                    "dropping event the source does not emit"
                );
                Outcome::Dropped(DropReason::UnroutableEvent)
            }
        };

        if !matches!(outcome, Outcome::Duplicate | Outcome::Dropped(_)) {
            self.stats.applied += 1;
        }
        Ok(outcome)
    }

    /// `AccountCreated` from the factory: count the deployment, create the
    /// account record, register the account as an event source.
    fn handle_account_created(
        &mut self,
        event: &EventEnvelope,
        account: Address,
        owner: Address,
    ) -> Result<Outcome, StoreError> {
        let account_id = EntityId::from_address(account);

        // Redelivery guard: an existing record means this creation was
        // already counted. No mutation at all, only re-assert routing.
        if self.store.load::<Account>(&account_id).is_some() {
            self.stats.duplicate_creations += 1;
            self.registry.register_account_source(account);
            debug!(account = %account_id, "duplicate AccountCreated ignored");
            return Ok(Outcome::Duplicate);
        }

        let factory_id = EntityId::from_address(event.source);
        let mut factory = self
            .store
            .load::<Factory>(&factory_id)
            .unwrap_or_else(|| Factory::new(factory_id));
        factory.total_accounts += 1;
        self.store.save(factory)?;

        self.store.create(Account {
            id: account_id,
            owner,
            factory: factory_id,
            created_at: event.block_timestamp,
            transactions: Vec::new(),
        })?;

        let newly_registered = self.registry.register_account_source(account);
        debug!(
            account = %account_id,
            factory = %factory_id,
            owner = %owner,
            "account created"
        );

        Ok(Outcome::AccountCreated {
            account,
            newly_registered,
        })
    }

    /// `TransactionExecuted` from an account: append an immutable
    /// transaction record to the account's history.
    fn handle_transaction_executed(
        &mut self,
        event: &EventEnvelope,
        target: Address,
        value: U256,
        data: Bytes,
    ) -> Result<Outcome, StoreError> {
        let account_id = EntityId::from_address(event.source);

        // Never write an orphan transaction: a registered source without
        // an account record means the creation event has not been applied.
        let Some(mut account) = self.store.load::<Account>(&account_id) else {
            self.stats.dropped_missing_account += 1;
            warn!(
                account = %account_id,
                tx_hash = %event.tx_hash,
                "dropping execution event for missing account"
            );
            return Ok(Outcome::Dropped(DropReason::MissingAccount));
        };

        let id = TransactionId::derive(event.tx_hash, event.log_index);
        if self.store.load::<Transaction>(&id).is_some() {
            self.stats.duplicate_transactions += 1;
            debug!(transaction = %id, "duplicate TransactionExecuted ignored");
            return Ok(Outcome::Duplicate);
        }

        self.store.create(Transaction {
            id: id.clone(),
            account: account_id,
            target,
            value,
            data,
            timestamp: event.block_timestamp,
            block_number: event.block_number,
            transaction_hash: event.tx_hash,
        })?;

        account.transactions.push(id.clone());
        self.store.save(account)?;
        debug!(transaction = %id, account = %account_id, "transaction recorded");

        Ok(Outcome::TransactionRecorded { id })
    }

    /// `SmartAccountInitialized` from an account: assign the owner once.
    ///
    /// Deployment flows that defer owner assignment emit this from the
    /// account itself; the deploying factory is the transaction sender.
    /// When the account record does not exist yet the event creates it —
    /// and counts it on the factory — so either arrival order of creation
    /// and initialization converges to the same state.
    fn handle_account_initialized(
        &mut self,
        event: &EventEnvelope,
        owner: Address,
    ) -> Result<Outcome, StoreError> {
        let account_id = EntityId::from_address(event.source);

        if let Some(mut account) = self.store.load::<Account>(&account_id) {
            if account.owner != Address::ZERO {
                self.stats.duplicate_initializations += 1;
                debug!(account = %account_id, "owner already set, initialization ignored");
                return Ok(Outcome::Duplicate);
            }
            account.owner = owner;
            self.store.save(account)?;
            debug!(account = %account_id, owner = %owner, "account owner assigned");
            return Ok(Outcome::AccountInitialized {
                account: event.source,
            });
        }

        let deployer = event.tx_from.ok_or_else(|| StoreError::Validation {
            kind: "account",
            reason: format!(
                "initialization of {account_id} carries no transaction sender to identify the factory"
            ),
        })?;

        let factory_id = EntityId::from_address(deployer);
        let mut factory = self
            .store
            .load::<Factory>(&factory_id)
            .unwrap_or_else(|| Factory::new(factory_id));
        factory.total_accounts += 1;
        self.store.save(factory)?;

        self.store.create(Account {
            id: account_id,
            owner,
            factory: factory_id,
            created_at: event.block_timestamp,
            transactions: Vec::new(),
        })?;
        debug!(
            account = %account_id,
            factory = %factory_id,
            owner = %owner,
            "account created by deferred initialization"
        );

        Ok(Outcome::AccountInitialized {
            account: event.source,
        })
    }

    /// Begin routing future events from `address` to the account handler.
    /// Idempotent, see [`SourceRegistry::register_account_source`].
    pub fn register_account_source(&mut self, address: Address) -> bool {
        self.registry.register_account_source(address)
    }

    /// The derived-state store.
    #[must_use]
    pub const fn store(&self) -> &EntityStore {
        &self.store
    }

    /// The source registry.
    #[must_use]
    pub const fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// The observability counters.
    #[must_use]
    pub const fn stats(&self) -> &IndexerStats {
        &self.stats
    }

    /// Persist the store and counters to `path` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub fn snapshot(&self, path: &Path) -> Result<(), StoreError> {
        store::write_json(
            path,
            &SnapshotRef {
                store: &self.store,
                stats: &self.stats,
            },
        )
    }

    /// Restore an indexer from a snapshot, rebuilding the source registry
    /// from the account records. Returns `None` when no snapshot exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the snapshot exists but
    /// cannot be read or parsed.
    pub fn restore(path: &Path, factory: Address) -> Result<Option<Self>, StoreError> {
        let Some(snapshot) = store::read_json::<Snapshot>(path)? else {
            return Ok(None);
        };

        let mut registry = SourceRegistry::new(factory);
        for account in snapshot.store.iter::<Account>() {
            registry.register_account_source(account.id.address());
        }

        Ok(Some(Self {
            store: snapshot.store,
            registry,
            stats: snapshot.stats,
        }))
    }

    /// [`Indexer::restore`], falling back to an empty indexer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when a snapshot exists but
    /// cannot be read or parsed.
    pub fn restore_or_new(path: &Path, factory: Address) -> Result<Self, StoreError> {
        Ok(Self::restore(path, factory)?.unwrap_or_else(|| Self::new(factory)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;

    const FACTORY: Address = Address::repeat_byte(0x0f);
    const ACCOUNT_A: Address = Address::repeat_byte(0x0a);
    const ACCOUNT_B: Address = Address::repeat_byte(0x0b);

    fn created(account: Address, owner: Address, timestamp: u64, log_index: u64) -> EventEnvelope {
        EventEnvelope {
            source: FACTORY,
            block_number: timestamp / 10,
            block_timestamp: timestamp,
            tx_hash: B256::repeat_byte(0xc0),
            tx_from: None,
            log_index,
            payload: EventPayload::AccountCreated { account, owner },
        }
    }

    fn executed(
        account: Address,
        target: Address,
        value: u64,
        tx_hash: B256,
        timestamp: u64,
        log_index: u64,
    ) -> EventEnvelope {
        EventEnvelope {
            source: account,
            block_number: timestamp / 10,
            block_timestamp: timestamp,
            tx_hash,
            tx_from: None,
            log_index,
            payload: EventPayload::TransactionExecuted {
                target,
                value: U256::from(value),
                data: Bytes::from(vec![0x12, 0x34]),
            },
        }
    }

    fn initialized(account: Address, owner: Address, tx_from: Option<Address>) -> EventEnvelope {
        EventEnvelope {
            source: account,
            block_number: 30,
            block_timestamp: 300,
            tx_hash: B256::repeat_byte(0xc1),
            tx_from,
            log_index: 0,
            payload: EventPayload::AccountInitialized { owner },
        }
    }

    fn owner() -> Address {
        Address::repeat_byte(0x0e)
    }

    #[test]
    fn round_trip_creation_then_execution() {
        let mut indexer = Indexer::new(FACTORY);

        let outcome = indexer.dispatch(&created(ACCOUNT_A, owner(), 100, 0)).unwrap();
        assert_eq!(
            outcome,
            Outcome::AccountCreated {
                account: ACCOUNT_A,
                newly_registered: true,
            }
        );

        let tx_hash = B256::repeat_byte(0x71);
        let outcome = indexer
            .dispatch(&executed(ACCOUNT_A, ACCOUNT_B, 5, tx_hash, 200, 1))
            .unwrap();
        let id = TransactionId::derive(tx_hash, 1);
        assert_eq!(outcome, Outcome::TransactionRecorded { id: id.clone() });

        let store = indexer.store();
        let factory = store
            .load::<Factory>(&EntityId::from_address(FACTORY))
            .unwrap();
        assert_eq!(factory.total_accounts, 1);

        let account = store
            .load::<Account>(&EntityId::from_address(ACCOUNT_A))
            .unwrap();
        assert_eq!(account.owner, owner());
        assert_eq!(account.factory, EntityId::from_address(FACTORY));
        assert_eq!(account.created_at, 100);
        assert_eq!(account.transactions, vec![id.clone()]);

        let tx = store.load::<Transaction>(&id).unwrap();
        assert_eq!(tx.account, EntityId::from_address(ACCOUNT_A));
        assert_eq!(tx.target, ACCOUNT_B);
        assert_eq!(tx.value, U256::from(5u64));
        assert_eq!(tx.data, Bytes::from(vec![0x12, 0x34]));
        assert_eq!(tx.timestamp, 200);
    }

    #[test]
    fn duplicate_creation_changes_nothing() {
        let mut indexer = Indexer::new(FACTORY);
        indexer.dispatch(&created(ACCOUNT_A, owner(), 100, 0)).unwrap();
        let before = indexer.store().clone();

        let outcome = indexer
            .dispatch(&created(ACCOUNT_A, Address::repeat_byte(0x99), 150, 1))
            .unwrap();

        assert_eq!(outcome, Outcome::Duplicate);
        assert_eq!(indexer.store(), &before);
        assert_eq!(indexer.stats().duplicate_creations, 1);
    }

    #[test]
    fn counter_tracks_distinct_accounts_only() {
        let mut indexer = Indexer::new(FACTORY);
        indexer.dispatch(&created(ACCOUNT_A, owner(), 100, 0)).unwrap();
        indexer.dispatch(&created(ACCOUNT_A, owner(), 100, 0)).unwrap();
        indexer.dispatch(&created(ACCOUNT_B, owner(), 110, 1)).unwrap();
        indexer.dispatch(&created(ACCOUNT_B, owner(), 110, 1)).unwrap();

        let factory = indexer
            .store()
            .load::<Factory>(&EntityId::from_address(FACTORY))
            .unwrap();
        assert_eq!(factory.total_accounts, 2);
        assert_eq!(indexer.store().count::<Account>(), 2);

        let account_b = indexer
            .store()
            .load::<Account>(&EntityId::from_address(ACCOUNT_B))
            .unwrap();
        assert_eq!(account_b.factory, EntityId::from_address(FACTORY));
    }

    #[test]
    fn execution_before_creation_is_dropped() {
        let mut indexer = Indexer::new(FACTORY);

        // Never registered at all.
        let outcome = indexer
            .dispatch(&executed(ACCOUNT_A, ACCOUNT_B, 1, B256::repeat_byte(0x71), 50, 0))
            .unwrap();
        assert_eq!(outcome, Outcome::Dropped(DropReason::UnknownSource));
        assert_eq!(indexer.stats().dropped_unknown_source, 1);

        // Registered as a source, but no account record yet.
        indexer.register_account_source(ACCOUNT_A);
        let outcome = indexer
            .dispatch(&executed(ACCOUNT_A, ACCOUNT_B, 1, B256::repeat_byte(0x71), 50, 0))
            .unwrap();
        assert_eq!(outcome, Outcome::Dropped(DropReason::MissingAccount));
        assert_eq!(indexer.stats().dropped_missing_account, 1);
        assert_eq!(indexer.store().count::<Transaction>(), 0);
    }

    #[test]
    fn duplicate_transaction_keeps_first_write() {
        let mut indexer = Indexer::new(FACTORY);
        indexer.dispatch(&created(ACCOUNT_A, owner(), 100, 0)).unwrap();

        let tx_hash = B256::repeat_byte(0x71);
        indexer
            .dispatch(&executed(ACCOUNT_A, ACCOUNT_B, 5, tx_hash, 200, 1))
            .unwrap();
        let outcome = indexer
            .dispatch(&executed(ACCOUNT_A, Address::repeat_byte(0x99), 9, tx_hash, 250, 1))
            .unwrap();

        assert_eq!(outcome, Outcome::Duplicate);
        let id = TransactionId::derive(tx_hash, 1);
        let tx = indexer.store().load::<Transaction>(&id).unwrap();
        assert_eq!(tx.target, ACCOUNT_B);
        assert_eq!(tx.value, U256::from(5u64));

        let account = indexer
            .store()
            .load::<Account>(&EntityId::from_address(ACCOUNT_A))
            .unwrap();
        assert_eq!(account.transactions.len(), 1);
    }

    #[test]
    fn one_transaction_per_execution_within_a_single_tx() {
        let mut indexer = Indexer::new(FACTORY);
        indexer.dispatch(&created(ACCOUNT_A, owner(), 100, 0)).unwrap();

        let tx_hash = B256::repeat_byte(0x71);
        indexer
            .dispatch(&executed(ACCOUNT_A, ACCOUNT_B, 1, tx_hash, 200, 3))
            .unwrap();
        indexer
            .dispatch(&executed(ACCOUNT_A, ACCOUNT_B, 2, tx_hash, 200, 4))
            .unwrap();

        assert_eq!(indexer.store().count::<Transaction>(), 2);
        let account = indexer
            .store()
            .load::<Account>(&EntityId::from_address(ACCOUNT_A))
            .unwrap();
        assert_eq!(
            account.transactions,
            vec![
                TransactionId::derive(tx_hash, 3),
                TransactionId::derive(tx_hash, 4),
            ]
        );
    }

    #[test]
    fn deferred_initialization_creates_and_counts_the_account() {
        let mut indexer = Indexer::new(FACTORY);
        indexer.register_account_source(ACCOUNT_A);

        let outcome = indexer
            .dispatch(&initialized(ACCOUNT_A, owner(), Some(FACTORY)))
            .unwrap();
        assert_eq!(outcome, Outcome::AccountInitialized { account: ACCOUNT_A });

        let account = indexer
            .store()
            .load::<Account>(&EntityId::from_address(ACCOUNT_A))
            .unwrap();
        assert_eq!(account.owner, owner());
        assert_eq!(account.factory, EntityId::from_address(FACTORY));
        assert_eq!(account.created_at, 300);

        let factory = indexer
            .store()
            .load::<Factory>(&EntityId::from_address(FACTORY))
            .unwrap();
        assert_eq!(factory.total_accounts, 1);

        // The creation event arriving afterwards is a redelivery.
        let outcome = indexer.dispatch(&created(ACCOUNT_A, owner(), 100, 0)).unwrap();
        assert_eq!(outcome, Outcome::Duplicate);
        let factory = indexer
            .store()
            .load::<Factory>(&EntityId::from_address(FACTORY))
            .unwrap();
        assert_eq!(factory.total_accounts, 1);
    }

    #[test]
    fn owner_is_write_once() {
        let mut indexer = Indexer::new(FACTORY);
        indexer
            .dispatch(&created(ACCOUNT_A, Address::ZERO, 100, 0))
            .unwrap();

        // Zero owner from creation counts as unset and may be assigned.
        let outcome = indexer
            .dispatch(&initialized(ACCOUNT_A, owner(), Some(FACTORY)))
            .unwrap();
        assert_eq!(outcome, Outcome::AccountInitialized { account: ACCOUNT_A });

        // A second initialization never rewrites it.
        let outcome = indexer
            .dispatch(&initialized(ACCOUNT_A, Address::repeat_byte(0x99), Some(FACTORY)))
            .unwrap();
        assert_eq!(outcome, Outcome::Duplicate);

        let account = indexer
            .store()
            .load::<Account>(&EntityId::from_address(ACCOUNT_A))
            .unwrap();
        assert_eq!(account.owner, owner());
        assert_eq!(indexer.stats().duplicate_initializations, 1);
    }

    #[test]
    fn initialization_without_sender_fails_validation() {
        let mut indexer = Indexer::new(FACTORY);
        indexer.register_account_source(ACCOUNT_A);

        let err = indexer
            .dispatch(&initialized(ACCOUNT_A, owner(), None))
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation { kind: "account", .. }));
        assert_eq!(indexer.store().count::<Account>(), 0);
    }

    #[test]
    fn events_the_source_does_not_emit_are_dropped() {
        let mut indexer = Indexer::new(FACTORY);
        indexer.dispatch(&created(ACCOUNT_A, owner(), 100, 0)).unwrap();

        // An account never emits AccountCreated.
        let mut event = created(ACCOUNT_B, owner(), 110, 1);
        event.source = ACCOUNT_A;
        let outcome = indexer.dispatch(&event).unwrap();
        assert_eq!(outcome, Outcome::Dropped(DropReason::UnroutableEvent));

        // The factory never emits TransactionExecuted.
        let event = executed(FACTORY, ACCOUNT_B, 1, B256::repeat_byte(0x71), 120, 2);
        let outcome = indexer.dispatch(&event).unwrap();
        assert_eq!(outcome, Outcome::Dropped(DropReason::UnroutableEvent));

        assert_eq!(indexer.stats().dropped_unroutable, 2);
        assert_eq!(indexer.store().count::<Account>(), 1);
    }

    #[test]
    fn snapshot_restore_round_trip_rebuilds_routing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut indexer = Indexer::new(FACTORY);
        indexer.dispatch(&created(ACCOUNT_A, owner(), 100, 0)).unwrap();
        indexer
            .dispatch(&executed(ACCOUNT_A, ACCOUNT_B, 5, B256::repeat_byte(0x71), 200, 1))
            .unwrap();
        indexer.snapshot(&path).unwrap();

        let mut restored = Indexer::restore(&path, FACTORY).unwrap().unwrap();
        assert_eq!(restored.store(), indexer.store());
        assert_eq!(restored.stats(), indexer.stats());

        // Routing for the discovered account survives the restart.
        let outcome = restored
            .dispatch(&executed(ACCOUNT_A, ACCOUNT_B, 7, B256::repeat_byte(0x72), 300, 0))
            .unwrap();
        assert!(matches!(outcome, Outcome::TransactionRecorded { .. }));
    }

    #[test]
    fn restore_without_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        assert!(Indexer::restore(&path, FACTORY).unwrap().is_none());
        let fresh = Indexer::restore_or_new(&path, FACTORY).unwrap();
        assert_eq!(fresh.store().count::<Account>(), 0);
    }
}
