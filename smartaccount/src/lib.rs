//! Smart-account event and entity model.
//!
//! This crate defines the on-chain event surface of a smart-account
//! deployment (factory plus the accounts it deploys) and the derived-state
//! records an indexer maintains from that event stream:
//!
//! - [`events`] — alloy bindings for `AccountCreated`,
//!   `TransactionExecuted` and `SmartAccountInitialized`, and the decoded
//!   [`events::EventEnvelope`] form that dispatchers consume.
//! - [`entities`] — the [`entities::Factory`], [`entities::Account`] and
//!   [`entities::Transaction`] records together with their canonical ids.
//! - [`error`] — the typed failure taxonomy shared by decoders and stores.

pub mod entities;
pub mod error;
pub mod events;

pub use entities::{Account, EntityId, Factory, Transaction, TransactionId};
pub use error::{EventError, StoreError};
pub use events::{EventEnvelope, EventPayload};
