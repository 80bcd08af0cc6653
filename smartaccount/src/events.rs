//! Contract event bindings and the decoded envelope form.
//!
//! The factory emits `AccountCreated`; each deployed account emits
//! `TransactionExecuted` and, in deployments that defer owner assignment,
//! `SmartAccountInitialized`. Raw logs are decoded into an
//! [`EventEnvelope`] — event payload plus the block and transaction
//! coordinates a dispatcher needs — by matching `topic0` against the known
//! signatures.

use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;

use crate::error::EventError;

sol! {
    /// Emitted by the factory when it deploys a new smart account.
    #[derive(Debug, PartialEq, Eq)]
    event AccountCreated(address indexed account, address indexed owner);

    /// Emitted by a smart account after executing a call.
    #[derive(Debug, PartialEq, Eq)]
    event TransactionExecuted(address indexed target, uint256 value, bytes data);

    /// Emitted by a smart account when its owner is assigned.
    #[derive(Debug, PartialEq, Eq)]
    event SmartAccountInitialized(address indexed owner);
}

/// Decoded event payload, one variant per known signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// A new account was deployed by the factory.
    AccountCreated {
        /// Address of the deployed account.
        account: Address,
        /// Owner assigned at creation.
        owner: Address,
    },

    /// An account executed a call.
    TransactionExecuted {
        /// Address called.
        target: Address,
        /// Native-asset amount forwarded.
        value: U256,
        /// Opaque calldata.
        data: Bytes,
    },

    /// An account assigned its owner.
    AccountInitialized {
        /// The assigned owner.
        owner: Address,
    },
}

impl EventPayload {
    /// Event name, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AccountCreated { .. } => "AccountCreated",
            Self::TransactionExecuted { .. } => "TransactionExecuted",
            Self::AccountInitialized { .. } => "SmartAccountInitialized",
        }
    }
}

/// A decoded event with the coordinates dispatch and handlers depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    /// The contract that emitted the event.
    pub source: Address,

    /// Block the event was emitted in.
    pub block_number: u64,

    /// Timestamp (unix seconds) of that block.
    pub block_timestamp: u64,

    /// Hash of the emitting on-chain transaction.
    pub tx_hash: B256,

    /// Sender of the emitting transaction, when resolved. Only needed by
    /// `SmartAccountInitialized` handling, where it identifies the
    /// deploying factory.
    pub tx_from: Option<Address>,

    /// Log index within the block.
    pub log_index: u64,

    /// The decoded payload.
    pub payload: EventPayload,
}

impl EventEnvelope {
    /// Decode a raw log into an envelope.
    ///
    /// The block timestamp is supplied by the caller because `eth_getLogs`
    /// responses do not reliably carry one; fetchers resolve it from the
    /// block header. `tx_from` is left unresolved.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownSignature`] for foreign events,
    /// [`EventError::MissingField`] when the log lacks block or transaction
    /// coordinates, and [`EventError::Decode`] when the payload does not
    /// match the signature's ABI.
    pub fn from_log(log: &Log, block_timestamp: u64) -> Result<Self, EventError> {
        let topic0 = log
            .topics()
            .first()
            .copied()
            .ok_or(EventError::MissingField { field: "topic0" })?;
        let block_number = log.block_number.ok_or(EventError::MissingField {
            field: "block_number",
        })?;
        let tx_hash = log.transaction_hash.ok_or(EventError::MissingField {
            field: "transaction_hash",
        })?;
        let log_index = log.log_index.ok_or(EventError::MissingField {
            field: "log_index",
        })?;

        let payload = match topic0 {
            t if t == AccountCreated::SIGNATURE_HASH => {
                let ev = AccountCreated::decode_log_data(log.data()).map_err(|source| {
                    EventError::Decode {
                        event: "AccountCreated",
                        source,
                    }
                })?;
                EventPayload::AccountCreated {
                    account: ev.account,
                    owner: ev.owner,
                }
            }
            t if t == TransactionExecuted::SIGNATURE_HASH => {
                let ev = TransactionExecuted::decode_log_data(log.data()).map_err(|source| {
                    EventError::Decode {
                        event: "TransactionExecuted",
                        source,
                    }
                })?;
                EventPayload::TransactionExecuted {
                    target: ev.target,
                    value: ev.value,
                    data: ev.data,
                }
            }
            t if t == SmartAccountInitialized::SIGNATURE_HASH => {
                let ev = SmartAccountInitialized::decode_log_data(log.data()).map_err(
                    |source| EventError::Decode {
                        event: "SmartAccountInitialized",
                        source,
                    },
                )?;
                EventPayload::AccountInitialized { owner: ev.owner }
            }
            topic0 => return Err(EventError::UnknownSignature { topic0 }),
        };

        Ok(Self {
            source: log.address(),
            block_number,
            block_timestamp,
            tx_hash,
            tx_from: None,
            log_index,
            payload,
        })
    }
}
