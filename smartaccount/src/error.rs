//! Failure taxonomy shared by event decoding and the entity store.

use alloy::primitives::B256;

/// Errors raised while decoding a raw log into an event envelope.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The log's first topic does not match any known event.
    #[error("unknown event signature {topic0:#x}")]
    UnknownSignature {
        /// The unrecognized `topic0` value.
        topic0: B256,
    },

    /// The log is missing a field the envelope requires.
    #[error("log missing {field}")]
    MissingField {
        /// Name of the absent field.
        field: &'static str,
    },

    /// The log matched a known signature but its payload did not decode.
    #[error("failed to decode {event} log")]
    Decode {
        /// Event name the decoder was expecting.
        event: &'static str,
        /// Underlying ABI decoding failure.
        #[source]
        source: alloy::sol_types::Error,
    },
}

/// Errors raised by entity-store operations.
///
/// Duplicates are an expected consequence of at-least-once delivery and are
/// recovered locally by the handlers; validation and availability failures
/// abort the current event and propagate to the caller.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A record failed its own consistency checks on save.
    #[error("validation failed for {kind}: {reason}")]
    Validation {
        /// Entity kind name.
        kind: &'static str,
        /// Human-readable description of the violated requirement.
        reason: String,
    },

    /// A create hit an id that already exists.
    #[error("{kind} `{id}` already exists")]
    Duplicate {
        /// Entity kind name.
        kind: &'static str,
        /// The colliding id.
        id: String,
    },

    /// The backing persistence could not be reached or parsed.
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Underlying fault description.
        reason: String,
    },
}

impl StoreError {
    /// Wrap an infrastructure fault as [`StoreError::Unavailable`].
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            reason: err.to_string(),
        }
    }
}
