//! Subscription Store
//!
//! Maintains the bidirectional index between clients and symbols on top of
//! a [`SetStorePort`]:
//!
//! ```text
//! client:{id}:{asset}      -> { symbol, ... }
//! symbol:{asset}:{symbol}  -> { client id, ... }
//! ```
//!
//! Every public operation is bounded by a timeout. Mutations are grouped
//! into one pipelined batch per asset class (full teardown uses a single
//! batch across classes). Batches are not atomic, so a failure part-way
//! through can leave the two directions out of step until the next write
//! for that client and asset class.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::application::ports::{SetBatch, SetStorePort, StoreError};
use crate::domain::event::ClientId;
use crate::domain::subscription::{
    AssetClass, ClientSub, Symbol, SubscriptionSnapshot, SymbolUpdate, client_key, symbol_key,
};

/// Default per-operation deadline.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Client <-> symbol subscription index.
#[derive(Clone)]
pub struct SubscriptionStore {
    store: Arc<dyn SetStorePort>,
    timeout: Duration,
}

impl std::fmt::Debug for SubscriptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SubscriptionStore {
    /// Create a store over a backend with the given per-operation deadline.
    #[must_use]
    pub fn new(store: Arc<dyn SetStorePort>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Per-operation deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Replace a client's symbols for every asset class present in `sub`.
    ///
    /// [`SymbolUpdate::Unchanged`] classes are untouched,
    /// [`SymbolUpdate::Clear`] empties the class and
    /// [`SymbolUpdate::Replace`] makes the stored set equal the given list.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the deadline passes.
    pub async fn set_client_subs(&self, sub: &ClientSub) -> Result<(), StoreError> {
        self.bounded(async {
            for asset in AssetClass::all() {
                let Some(symbols) = sub.get(*asset).symbols() else {
                    continue;
                };
                self.replace_class(sub.id, *asset, symbols).await?;
            }
            Ok(())
        })
        .await
    }

    /// Add the symbols of one asset class of `sub` to the client's set.
    ///
    /// A no-op when that class is unchanged or empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the deadline passes.
    pub async fn patch_client_sub(
        &self,
        asset: AssetClass,
        sub: &ClientSub,
    ) -> Result<(), StoreError> {
        let SymbolUpdate::Replace(symbols) = sub.get(asset) else {
            return Ok(());
        };

        let client = sub.id.to_string();
        let mut batch = SetBatch::new();
        batch.add(client_key(sub.id, asset), symbols.clone());
        for symbol in symbols {
            batch.add(symbol_key(asset, symbol), vec![client.clone()]);
        }

        self.bounded(self.store.execute(batch)).await
    }

    /// Remove specific symbols from one asset class of a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the deadline passes.
    pub async fn remove_client_symbols(
        &self,
        client: ClientId,
        asset: AssetClass,
        symbols: &[Symbol],
    ) -> Result<(), StoreError> {
        if symbols.is_empty() {
            return Ok(());
        }

        let forward = client_key(client, asset);
        let member = client.to_string();
        let mut batch = SetBatch::new();
        for symbol in symbols {
            batch
                .remove(forward.clone(), symbol.clone())
                .remove(symbol_key(asset, symbol), member.clone());
        }

        self.bounded(self.store.execute(batch)).await
    }

    /// Remove every subscription a client holds, across all asset classes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the deadline passes.
    pub async fn remove_client_subs(&self, client: ClientId) -> Result<(), StoreError> {
        self.bounded(async {
            let mut batch = SetBatch::new();
            for asset in AssetClass::all() {
                let current = self.store.members(&client_key(client, *asset)).await?;
                Self::queue_teardown(&mut batch, client, *asset, &current);
            }
            self.store.execute(batch).await
        })
        .await
    }

    /// Remove every subscription a client holds in one asset class.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the deadline passes.
    pub async fn remove_client_subs_by_asset(
        &self,
        client: ClientId,
        asset: AssetClass,
    ) -> Result<(), StoreError> {
        self.bounded(async {
            let current = self.store.members(&client_key(client, asset)).await?;
            let mut batch = SetBatch::new();
            Self::queue_teardown(&mut batch, client, asset, &current);
            self.store.execute(batch).await
        })
        .await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Symbols a client holds in one asset class.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the deadline passes.
    pub async fn client_symbols(
        &self,
        client: ClientId,
        asset: AssetClass,
    ) -> Result<Vec<Symbol>, StoreError> {
        self.bounded(self.store.members(&client_key(client, asset)))
            .await
    }

    /// Clients subscribed to one symbol.
    ///
    /// Members that are not valid client ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the deadline passes.
    pub async fn symbol_subscribers(
        &self,
        asset: AssetClass,
        symbol: &str,
    ) -> Result<Vec<ClientId>, StoreError> {
        let members = self
            .bounded(self.store.members(&symbol_key(asset, symbol)))
            .await?;

        Ok(members
            .iter()
            .filter_map(|member| match member.parse::<ClientId>() {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::warn!(
                        asset = %asset,
                        symbol = %symbol,
                        member = %member,
                        "Skipping malformed client id in reverse index"
                    );
                    None
                }
            })
            .collect())
    }

    /// A client's symbols across all asset classes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the deadline passes.
    pub async fn client_subscriptions(
        &self,
        client: ClientId,
    ) -> Result<SubscriptionSnapshot, StoreError> {
        self.bounded(async {
            let mut snapshot = SubscriptionSnapshot::default();
            for asset in AssetClass::all() {
                let symbols = self.store.members(&client_key(client, *asset)).await?;
                snapshot.set(*asset, symbols);
            }
            Ok(snapshot)
        })
        .await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn replace_class(
        &self,
        client: ClientId,
        asset: AssetClass,
        symbols: &[Symbol],
    ) -> Result<(), StoreError> {
        let current = self.store.members(&client_key(client, asset)).await?;

        let member = client.to_string();
        let mut batch = SetBatch::new();
        Self::queue_teardown(&mut batch, client, asset, &current);
        batch.add(client_key(client, asset), symbols.to_vec());
        for symbol in symbols {
            batch.add(symbol_key(asset, symbol), vec![member.clone()]);
        }

        tracing::debug!(
            client_id = %client,
            asset = %asset,
            removed = current.len(),
            added = symbols.len(),
            "Replacing client subscriptions"
        );

        self.store.execute(batch).await
    }

    fn queue_teardown(
        batch: &mut SetBatch,
        client: ClientId,
        asset: AssetClass,
        current: &[Symbol],
    ) {
        let member = client.to_string();
        for symbol in current {
            batch.remove(symbol_key(asset, symbol), member.clone());
        }
        batch.delete(client_key(client, asset));
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, operation)
            .await
            .map_err(|_| StoreError::Timeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            })?
    }
}

// =============================================================================
// Tests
// =============================================================================
