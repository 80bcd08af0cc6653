//! Dynamic source registry.
//!
//! Routes an event's source address to the handler class that owns it.
//! The factory is known up front; account sources are discovered at
//! runtime when the factory reports a deployment, and registration is
//! permanent for the lifetime of the indexing run — there is no
//! unregistration.

use std::collections::BTreeSet;

use alloy::primitives::Address;

/// Handler class an event source routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// The statically configured factory contract.
    Factory,
    /// A deployed account discovered at runtime.
    Account,
}

/// Registered event sources: one factory plus the accounts it deployed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRegistry {
    factory: Address,
    accounts: BTreeSet<Address>,
}

impl SourceRegistry {
    /// A registry listening to `factory` and no accounts yet.
    #[must_use]
    pub const fn new(factory: Address) -> Self {
        Self {
            factory,
            accounts: BTreeSet::new(),
        }
    }

    /// Begin routing future events from `address` to the account handler.
    ///
    /// Idempotent: returns `false` when the address was already routed
    /// (including the factory address itself), `true` when newly
    /// registered.
    pub fn register_account_source(&mut self, address: Address) -> bool {
        if address == self.factory {
            return false;
        }
        self.accounts.insert(address)
    }

    /// Classify an event source, `None` when unknown.
    #[must_use]
    pub fn route(&self, source: Address) -> Option<SourceKind> {
        if source == self.factory {
            Some(SourceKind::Factory)
        } else if self.accounts.contains(&source) {
            Some(SourceKind::Account)
        } else {
            None
        }
    }

    /// The configured factory address.
    #[must_use]
    pub const fn factory(&self) -> Address {
        self.factory
    }

    /// Every registered source, factory first.
    #[must_use]
    pub fn sources(&self) -> Vec<Address> {
        std::iter::once(self.factory)
            .chain(self.accounts.iter().copied())
            .collect()
    }

    /// Number of registered account sources.
    #[must_use]
    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }
}
