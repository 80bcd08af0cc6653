//! RPC event fetching and sync orchestration.
//!
//! Each sync pass:
//! 1. Loads the cursor to find the first unprocessed block.
//! 2. Queries `eth_getLogs` in adaptive batches for every registered
//!    source, from the cursor to the confirmed head.
//! 3. Resolves block timestamps, sorts the logs into block order, and
//!    dispatches them through the indexer.
//! 4. Re-fetches the same range for accounts discovered mid-range, so a
//!    deployment and its first executions land in one pass.
//! 5. Writes the state snapshot, then advances the cursor.
//!
//! The cursor only moves after the snapshot is on disk, so an interrupted
//! pass replays its range on the next run — which the handlers absorb as
//! duplicates.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use anyhow::{Context, Result, anyhow, bail};
use smartaccount::{EntityId, EventEnvelope, EventError, EventPayload, StoreError};

use crate::config::Config;
use crate::cursor::Cursor;
use crate::handlers::{Indexer, Outcome};

/// Per-request timeout for RPC calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between consecutive RPC calls to avoid rate-limiting.
const INTER_BATCH_DELAY: Duration = Duration::from_millis(100);

/// Maximum consecutive RPC errors before giving up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Progress is logged every N batches.
const PROGRESS_INTERVAL: u64 = 50;

/// Tracks `eth_getLogs` batch size with an adaptive ceiling.
///
/// On success the size doubles toward the ceiling; on error the ceiling
/// is permanently lowered so the RPC's actual limit is learned once.
struct Batcher {
    size: u64,
    ceiling: u64,
}

impl Batcher {
    const DEFAULT: u64 = 2_000;
    const MIN: u64 = 10;

    const fn new() -> Self {
        Self {
            size: Self::DEFAULT,
            ceiling: Self::DEFAULT,
        }
    }

    /// Grow toward the learned ceiling after a successful request.
    fn grow(&mut self) {
        self.size = (self.size * 2).min(self.ceiling);
    }

    /// Shrink and lower the ceiling after a failed request.
    /// Returns `false` when already at the minimum (caller should bail).
    fn shrink(&mut self) -> bool {
        if self.size <= Self::MIN {
            return false;
        }
        self.ceiling = (self.size / 2).max(Self::MIN);
        self.size = self.ceiling;
        true
    }
}

/// Format progress as a percentage string.
fn pct(current: u64, from: u64, to: u64) -> String {
    if to <= from {
        return "100%".into();
    }
    let ratio = (current - from) as f64 / (to - from) as f64 * 100.0;
    format!("{ratio:.0}%")
}

/// Fetch all logs emitted by `sources` in `[from, to]` using adaptive
/// batches.
async fn fetch_logs<P: Provider>(
    provider: &P,
    sources: &[Address],
    from: u64,
    to: u64,
) -> Result<Vec<Log>> {
    let mut logs = Vec::new();
    let mut block = from;
    let mut batch = Batcher::new();
    let mut count = 0u64;
    let mut errors = 0u32;

    while block <= to {
        let end = (block + batch.size - 1).min(to);
        let filter = Filter::new()
            .address(sources.to_vec())
            .from_block(block)
            .to_block(end);

        let result = tokio::time::timeout(REQUEST_TIMEOUT, provider.get_logs(&filter))
            .await
            .map_err(|_| anyhow!("request timed out"))
            .and_then(|r| r.map_err(|e| anyhow!("{e}")));

        match result {
            Ok(new) => {
                errors = 0;
                logs.extend(new);
                batch.grow();
                block = end + 1;
                count += 1;
                if count.is_multiple_of(PROGRESS_INTERVAL) {
                    tracing::info!(batch = count, block, progress = %pct(block, from, to), "fetching");
                }
                tokio::time::sleep(INTER_BATCH_DELAY).await;
            }
            Err(e) => {
                errors += 1;
                if errors >= MAX_CONSECUTIVE_ERRORS {
                    bail!("{errors} consecutive errors at block {block}: {e}");
                }
                if !batch.shrink() {
                    bail!("failed at min batch size (block {block}): {e}");
                }
                tracing::warn!(block, batch_size = batch.size, error = %e, "retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }

    Ok(logs)
}

/// Resolve the timestamp of every block the logs touch, one header fetch
/// per distinct block.
async fn block_timestamps<P: Provider>(provider: &P, logs: &[Log]) -> Result<HashMap<u64, u64>> {
    let blocks: BTreeSet<u64> = logs.iter().filter_map(|log| log.block_number).collect();
    let mut timestamps = HashMap::with_capacity(blocks.len());

    for number in blocks {
        let block = provider
            .get_block_by_number(number.into())
            .await
            .with_context(|| format!("fetching block {number}"))?
            .with_context(|| format!("block {number} not found"))?;
        timestamps.insert(number, block.header.inner.timestamp);
    }

    Ok(timestamps)
}

/// Resolve the sender of an on-chain transaction, when the node still has
/// it. Only needed for deferred-initialization events, where the sender
/// identifies the deploying factory.
async fn transaction_sender<P: Provider>(provider: &P, tx_hash: B256) -> Result<Option<Address>> {
    let tx = provider
        .get_transaction_by_hash(tx_hash)
        .await
        .with_context(|| format!("fetching transaction {tx_hash:#x}"))?;
    Ok(tx.map(|tx| tx.inner.signer()))
}

/// Decode, order, and dispatch a set of raw logs.
///
/// Returns the account addresses newly registered while dispatching, so
/// the caller can re-fetch the range for them.
async fn dispatch_logs<P: Provider>(
    provider: &P,
    indexer: &mut Indexer,
    logs: &[Log],
) -> Result<Vec<Address>> {
    let timestamps = block_timestamps(provider, logs).await?;

    let mut envelopes = Vec::with_capacity(logs.len());
    for log in logs {
        if log.removed {
            continue;
        }
        let Some(block_number) = log.block_number else {
            continue;
        };
        let Some(&timestamp) = timestamps.get(&block_number) else {
            continue;
        };
        match EventEnvelope::from_log(log, timestamp) {
            Ok(envelope) => envelopes.push(envelope),
            Err(EventError::UnknownSignature { topic0 }) => {
                tracing::debug!(%topic0, source = %log.address(), "skipping foreign event");
            }
            Err(e) => {
                tracing::warn!(error = %e, source = %log.address(), "skipping undecodable log");
            }
        }
    }
    envelopes.sort_by_key(|e| (e.block_number, e.log_index));

    for envelope in &mut envelopes {
        if matches!(envelope.payload, EventPayload::AccountInitialized { .. }) {
            envelope.tx_from = transaction_sender(provider, envelope.tx_hash).await?;
        }
    }

    let mut new_sources = Vec::new();
    for envelope in &envelopes {
        match indexer.dispatch(envelope) {
            Ok(Outcome::AccountCreated {
                account,
                newly_registered: true,
            }) => new_sources.push(account),
            Ok(_) => {}
            // A validation failure is fatal for this event only; progress
            // continues and redelivery stays with the event source.
            Err(e @ StoreError::Validation { .. }) => {
                tracing::error!(
                    error = %e,
                    event = envelope.payload.name(),
                    source = %envelope.source,
                    block = envelope.block_number,
                    "event failed validation, skipping"
                );
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "dispatching {} from {} at block {}",
                        envelope.payload.name(),
                        envelope.source,
                        envelope.block_number
                    )
                });
            }
        }
    }

    Ok(new_sources)
}

/// Attempt a full catch-up pass using a single RPC endpoint.
async fn try_sync(config: &Config, indexer: &mut Indexer, rpc_url: &str) -> Result<()> {
    let factory_id = EntityId::from_address(config.factory);

    tracing::info!(rpc = rpc_url, factory = %factory_id, "connecting");
    let provider = ProviderBuilder::new().connect_http(
        rpc_url
            .parse()
            .with_context(|| format!("invalid RPC URL: {rpc_url}"))?,
    );

    let latest = tokio::time::timeout(REQUEST_TIMEOUT, provider.get_block_number())
        .await
        .context("get_block_number timed out")?
        .context("get_block_number failed")?;
    let safe = latest.saturating_sub(config.confirmations);

    let start = Cursor::load(&config.data_dir, factory_id)?
        .map_or(config.deployment_block, |c| c.last_block + 1);

    if start > safe {
        tracing::info!(latest, safe, "already up to date");
        return Ok(());
    }

    tracing::info!(from = start, to = safe, blocks = safe - start + 1, "syncing");

    // Dispatch, then re-fetch the range for any accounts discovered while
    // dispatching. The factory was already covered, so a rescan can only
    // surface execution events — the loop settles after one extra pass.
    let mut logs = fetch_logs(&provider, &indexer.registry().sources(), start, safe).await?;
    loop {
        let new_sources = dispatch_logs(&provider, indexer, &logs).await?;
        if new_sources.is_empty() {
            break;
        }
        tracing::info!(
            accounts = new_sources.len(),
            "rescanning range for newly discovered accounts"
        );
        logs = fetch_logs(&provider, &new_sources, start, safe).await?;
    }

    indexer.snapshot(&config.state_path())?;
    Cursor::now(factory_id, safe).save(&config.data_dir)?;

    let stats = indexer.stats();
    tracing::info!(
        last_block = safe,
        accounts = indexer.store().count::<smartaccount::Account>(),
        transactions = indexer.store().count::<smartaccount::Transaction>(),
        applied = stats.applied,
        dropped_unknown_source = stats.dropped_unknown_source,
        "sync complete"
    );
    Ok(())
}

/// Run one catch-up pass with automatic RPC fallback.
///
/// Tries each endpoint in `config.rpcs` in order. A failed attempt may
/// have dispatched part of its range; the cursor has not advanced, so the
/// next endpoint replays that range and the handlers absorb the
/// redeliveries as duplicates.
///
/// # Errors
///
/// Returns an error only if *all* RPCs fail.
pub async fn sync_once(config: &Config, indexer: &mut Indexer) -> Result<()> {
    let mut last_err = None;

    for (i, rpc_url) in config.rpcs.iter().enumerate() {
        match try_sync(config, indexer, rpc_url).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if let Some(next) = config.rpcs.get(i + 1) {
                    tracing::warn!(rpc = %rpc_url, next = %next, error = %e, "RPC failed, falling back");
                } else {
                    tracing::error!(rpc = %rpc_url, error = %e, "last RPC failed");
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no RPC endpoints configured")))
}

/// Continuously follow the chain: catch up, sleep, repeat.
///
/// # Errors
///
/// Propagates the first pass that fails on every configured RPC.
pub async fn watch(config: &Config, indexer: &mut Indexer) -> Result<()> {
    loop {
        sync_once(config, indexer).await?;
        tracing::debug!(
            seconds = config.poll_interval_secs,
            "waiting for new blocks"
        );
        tokio::time::sleep(Duration::from_secs(config.poll_interval_secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batcher_grows_to_ceiling() {
        let mut batch = Batcher::new();
        batch.size = 500;
        batch.grow();
        assert_eq!(batch.size, 1_000);
        batch.grow();
        batch.grow();
        assert_eq!(batch.size, Batcher::DEFAULT);
    }

    #[test]
    fn batcher_shrink_lowers_ceiling_permanently() {
        let mut batch = Batcher::new();
        assert!(batch.shrink());
        assert_eq!(batch.size, 1_000);
        assert_eq!(batch.ceiling, 1_000);

        batch.grow();
        assert_eq!(batch.size, 1_000);
    }

    #[test]
    fn batcher_refuses_to_shrink_below_minimum() {
        let mut batch = Batcher::new();
        while batch.size > Batcher::MIN {
            assert!(batch.shrink());
        }
        assert!(!batch.shrink());
        assert_eq!(batch.size, Batcher::MIN);
    }

    #[test]
    fn pct_is_clamped_and_rounded() {
        assert_eq!(pct(50, 0, 100), "50%");
        assert_eq!(pct(100, 100, 100), "100%");
        assert_eq!(pct(0, 0, 3), "0%");
    }
}
