//! Derived-state records maintained by the indexer.
//!
//! Every entity is keyed by a canonical id. Addresses are normalized to
//! their lowercase `0x`-prefixed hex form at the boundary — mixed-case or
//! unprefixed inputs map to the same [`EntityId`] — so record keys never
//! depend on how an upstream source happened to render an address.
//! Transactions use a composite id derived from the emitting transaction
//! hash and the log index, which stays collision-free when a single
//! on-chain transaction triggers several executions.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StoreError;

/// Canonical entity id: the lowercase hex form of a 20-byte address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(Address);

impl EntityId {
    /// Canonical id for an address.
    #[must_use]
    pub const fn from_address(address: Address) -> Self {
        Self(address)
    }

    /// Parse an id from a hex string, normalizing case and `0x` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] when the input is not a 20-byte
    /// hex address.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        Address::from_str(s)
            .map(Self)
            .map_err(|e| StoreError::Validation {
                kind: "entity id",
                reason: format!("`{s}` is not an address: {e}"),
            })
    }

    /// The underlying address.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<Address> for EntityId {
    fn from(address: Address) -> Self {
        Self(address)
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Composite transaction id: `{tx_hash}-{log_index}`, both in canonical
/// lowercase hex / decimal form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(String);

impl TransactionId {
    /// Derive the id for an execution event.
    #[must_use]
    pub fn derive(tx_hash: B256, log_index: u64) -> Self {
        Self(format!("{tx_hash:#x}-{log_index}"))
    }

    /// Parse an id from its string form.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] when the input is not a
    /// `{32-byte hex}-{decimal}` pair.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        let malformed = || StoreError::Validation {
            kind: "transaction id",
            reason: format!("`{s}` is not a `{{tx_hash}}-{{log_index}}` pair"),
        };
        let (hash, index) = s.rsplit_once('-').ok_or_else(malformed)?;
        let hash = B256::from_str(hash).map_err(|_| malformed())?;
        let index: u64 = index.parse().map_err(|_| malformed())?;
        Ok(Self::derive(hash, index))
    }

    /// Whether this id was derived from `tx_hash`.
    #[must_use]
    pub fn derives_from(&self, tx_hash: B256) -> bool {
        self.0
            .rsplit_once('-')
            .is_some_and(|(hash, _)| hash == format!("{tx_hash:#x}"))
    }

    /// The id's string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for TransactionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TransactionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A factory contract, created lazily on its first observed deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Factory {
    /// Factory contract address.
    pub id: EntityId,

    /// Number of accounts this factory has deployed. Monotonically
    /// non-decreasing; equals the number of [`Account`] records whose
    /// `factory` field is this id.
    pub total_accounts: u64,
}

impl Factory {
    /// A fresh factory record with no deployments counted yet.
    #[must_use]
    pub const fn new(id: EntityId) -> Self {
        Self {
            id,
            total_accounts: 0,
        }
    }
}

/// A deployed smart account.
///
/// `owner` and `factory` are write-once: `owner` may start as the zero
/// address when creation defers owner assignment to a later
/// `SmartAccountInitialized` event, and is never rewritten once set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Deployed account address.
    pub id: EntityId,

    /// Owner address controlling the account.
    pub owner: Address,

    /// The factory that deployed this account.
    pub factory: EntityId,

    /// Block timestamp (unix seconds) of the creation event.
    pub created_at: u64,

    /// Executed transactions, in arrival order.
    pub transactions: Vec<TransactionId>,
}

/// A call executed by an account. Append-only: never mutated once saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Composite id, see [`TransactionId::derive`].
    pub id: TransactionId,

    /// The account that executed the call.
    pub account: EntityId,

    /// Address called.
    pub target: Address,

    /// Native-asset amount forwarded with the call.
    pub value: U256,

    /// Opaque calldata.
    pub data: Bytes,

    /// Block timestamp (unix seconds) of the execution event.
    pub timestamp: u64,

    /// Block the event was emitted in.
    pub block_number: u64,

    /// Hash of the emitting on-chain transaction.
    pub transaction_hash: B256,
}
