//! Subscription Handlers
//!
//! Event handlers that let a client manage its entry in the subscription
//! index, plus the hook that clears that entry when the client leaves.
//!
//! | inbound             | payload                          | reply           |
//! |---------------------|----------------------------------|-----------------|
//! | `subscribe`         | `{assetClass, tickers}`          | `subscribed`    |
//! | `unsubscribe`       | `{assetClass, tickers}`          | `unsubscribed`  |
//! | `set_subscriptions` | `{forex?, equity?, crypto?}`     | `subscriptions` |

use std::sync::Arc;

use async_trait::async_trait;

use super::handlers::{EventHandler, HandlerContext, HandlerError};
use super::{DisconnectHook, Hub};
use crate::application::ports::StoreError;
use crate::application::services::SubscriptionStore;
use crate::domain::event::{ClientId, Event};
use crate::domain::subscription::{AssetClass, ClientSub, SubscribePayload, Symbol, SymbolUpdate};
use crate::infrastructure::metrics;

/// Add symbols to one asset class.
pub const SUBSCRIBE: &str = "subscribe";
/// Remove symbols, or a whole asset class.
pub const UNSUBSCRIBE: &str = "unsubscribe";
/// Replace symbols per asset class.
pub const SET_SUBSCRIPTIONS: &str = "set_subscriptions";
/// Reply to [`SUBSCRIBE`].
pub const SUBSCRIBED: &str = "subscribed";
/// Reply to [`UNSUBSCRIBE`].
pub const UNSUBSCRIBED: &str = "unsubscribed";
/// Reply to [`SET_SUBSCRIPTIONS`].
pub const SUBSCRIPTIONS: &str = "subscriptions";

/// Install the subscription handlers and the cleanup hook on a hub.
pub fn register_subscription_handlers(hub: &mut Hub, store: &SubscriptionStore) {
    hub.register_handler(SUBSCRIBE, Arc::new(SubscribeHandler::new(store.clone())))
        .register_handler(UNSUBSCRIBE, Arc::new(UnsubscribeHandler::new(store.clone())))
        .register_handler(
            SET_SUBSCRIPTIONS,
            Arc::new(SetSubscriptionsHandler::new(store.clone())),
        )
        .on_disconnect(Arc::new(SubscriptionCleanup::new(store.clone())));
}

fn observe<T>(operation: &'static str, result: Result<T, StoreError>) -> Result<T, StoreError> {
    metrics::record_store_operation(operation, result.is_ok());
    result
}

fn validate(payload: &SubscribePayload, allow_empty: bool) -> Result<(), HandlerError> {
    if payload.tickers.is_empty() && !allow_empty {
        return Err(HandlerError::Rejected(
            "tickers must not be empty".to_string(),
        ));
    }
    validate_tickers(&payload.tickers)
}

fn validate_tickers(tickers: &[Symbol]) -> Result<(), HandlerError> {
    if tickers.iter().any(|t| t.trim().is_empty()) {
        return Err(HandlerError::Rejected(
            "tickers must be non-blank strings".to_string(),
        ));
    }
    Ok(())
}

// =============================================================================
// subscribe
// =============================================================================

/// Merges tickers into the sender's set for one asset class.
#[derive(Debug, Clone)]
pub struct SubscribeHandler {
    store: SubscriptionStore,
}

impl SubscribeHandler {
    /// Create a handler over a store.
    #[must_use]
    pub const fn new(store: SubscriptionStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for SubscribeHandler {
    async fn handle(&self, ctx: &HandlerContext, event: Event) -> Result<(), HandlerError> {
        let payload: SubscribePayload = event.decode_payload()?;
        validate(&payload, false)?;

        let sub = ClientSub::for_client(ctx.client_id()).with(
            payload.asset_class,
            SymbolUpdate::replace(payload.tickers.iter().cloned()),
        );
        observe(
            "patch",
            self.store.patch_client_sub(payload.asset_class, &sub).await,
        )?;

        tracing::info!(
            client_id = %ctx.client_id(),
            asset = %payload.asset_class,
            tickers = payload.tickers.len(),
            "Client subscribed"
        );
        ctx.reply(Event::with_payload(SUBSCRIBED, &payload)?)
    }
}

// =============================================================================
// unsubscribe
// =============================================================================

/// Removes tickers from the sender's set, or the whole asset class when
/// `tickers` is empty.
#[derive(Debug, Clone)]
pub struct UnsubscribeHandler {
    store: SubscriptionStore,
}

impl UnsubscribeHandler {
    /// Create a handler over a store.
    #[must_use]
    pub const fn new(store: SubscriptionStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for UnsubscribeHandler {
    async fn handle(&self, ctx: &HandlerContext, event: Event) -> Result<(), HandlerError> {
        let payload: SubscribePayload = event.decode_payload()?;
        validate(&payload, true)?;

        let client = ctx.client_id();
        if payload.tickers.is_empty() {
            observe(
                "remove_asset",
                self.store
                    .remove_client_subs_by_asset(client, payload.asset_class)
                    .await,
            )?;
        } else {
            observe(
                "remove_symbols",
                self.store
                    .remove_client_symbols(client, payload.asset_class, &payload.tickers)
                    .await,
            )?;
        }

        tracing::info!(
            client_id = %client,
            asset = %payload.asset_class,
            tickers = payload.tickers.len(),
            "Client unsubscribed"
        );
        ctx.reply(Event::with_payload(UNSUBSCRIBED, &payload)?)
    }
}

// =============================================================================
// set_subscriptions
// =============================================================================

/// Replaces the sender's symbols per asset class and replies with the
/// resulting sets.
#[derive(Debug, Clone)]
pub struct SetSubscriptionsHandler {
    store: SubscriptionStore,
}

impl SetSubscriptionsHandler {
    /// Create a handler over a store.
    #[must_use]
    pub const fn new(store: SubscriptionStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for SetSubscriptionsHandler {
    async fn handle(&self, ctx: &HandlerContext, event: Event) -> Result<(), HandlerError> {
        let mut sub: ClientSub = event.decode_payload()?;
        sub.id = ctx.client_id();
        for asset in AssetClass::all() {
            if let Some(tickers) = sub.get(*asset).symbols() {
                validate_tickers(tickers)?;
            }
        }

        observe("set", self.store.set_client_subs(&sub).await)?;
        let snapshot = observe(
            "read",
            self.store.client_subscriptions(ctx.client_id()).await,
        )?;

        tracing::info!(client_id = %ctx.client_id(), "Client subscriptions replaced");
        ctx.reply(Event::with_payload(SUBSCRIPTIONS, &snapshot)?)
    }
}

// =============================================================================
// Disconnect cleanup
// =============================================================================

/// Removes every subscription of a client that left the hub.
#[derive(Debug, Clone)]
pub struct SubscriptionCleanup {
    store: SubscriptionStore,
}

impl SubscriptionCleanup {
    /// Create a hook over a store.
    #[must_use]
    pub const fn new(store: SubscriptionStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DisconnectHook for SubscriptionCleanup {
    async fn on_disconnect(&self, client: ClientId) {
        match observe("remove_all", self.store.remove_client_subs(client).await) {
            Ok(()) => tracing::debug!(client_id = %client, "Cleared client subscriptions"),
            Err(e) => tracing::error!(
                client_id = %client,
                error = %e,
                "Failed to clear client subscriptions"
            ),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::application::ports::MockSetStorePort;
    use crate::application::services::DEFAULT_STORE_TIMEOUT;
    use axum::extract::ws::Message;
    use test_case::test_case;

    use crate::infrastructure::hub::{Connection, HubHandle, Keepalive, Mailbox, read_pump};
    use crate::infrastructure::store::InMemorySetStore;

    struct Fixture {
        backend: Arc<InMemorySetStore>,
        store: SubscriptionStore,
        ctx: HandlerContext,
        mailbox: Mailbox,
        hub: HubHandle,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(InMemorySetStore::new());
        let store = SubscriptionStore::new(backend.clone(), DEFAULT_STORE_TIMEOUT);
        let mut hub = Hub::new();
        register_subscription_handlers(&mut hub, &store);
        let (hub, _task) = hub.start(CancellationToken::new());

        let (conn, mailbox) = Connection::new(Uuid::new_v4());
        hub.register(conn.clone()).await.unwrap();
        Fixture {
            backend,
            store,
            ctx: HandlerContext::new(conn, hub.clone()),
            mailbox,
            hub,
        }
    }

    #[tokio::test]
    async fn subscribe_merges_and_echoes() {
        let mut f = fixture().await;
        let handler = SubscribeHandler::new(f.store.clone());

        for tickers in [json!(["AAPL"]), json!(["MSFT"])] {
            let event = Event::new(SUBSCRIBE, json!({ "assetClass": "equity", "tickers": tickers }));
            handler.handle(&f.ctx, event).await.unwrap();
        }

        let reply = f.mailbox.recv().await.unwrap();
        assert_eq!(reply.kind, SUBSCRIBED);
        assert_eq!(reply.payload, json!({ "assetClass": "equity", "tickers": ["AAPL"] }));

        let mut symbols = f
            .store
            .client_symbols(f.ctx.client_id(), AssetClass::Equity)
            .await
            .unwrap();
        symbols.sort_unstable();
        assert_eq!(symbols, vec!["AAPL", "MSFT"]);
    }

    #[tokio::test]
    async fn subscribe_rejects_empty_tickers() {
        let f = fixture().await;
        let handler = SubscribeHandler::new(f.store.clone());
        let event = Event::new(SUBSCRIBE, json!({ "assetClass": "forex", "tickers": [] }));

        let err = handler.handle(&f.ctx, event).await.unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(_)));
        assert_eq!(f.backend.key_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_rejects_unknown_asset_class() {
        let f = fixture().await;
        let handler = SubscribeHandler::new(f.store.clone());
        let event = Event::new(SUBSCRIBE, json!({ "assetClass": "bonds", "tickers": ["X"] }));

        let err = handler.handle(&f.ctx, event).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn unsubscribe_with_empty_tickers_clears_asset_class() {
        let mut f = fixture().await;
        let client = f.ctx.client_id();
        let sub = ClientSub::for_client(client)
            .with(AssetClass::Forex, SymbolUpdate::replace(["EURUSD", "GBPUSD"]))
            .with(AssetClass::Crypto, SymbolUpdate::replace(["BTCUSD"]));
        f.store.set_client_subs(&sub).await.unwrap();

        let handler = UnsubscribeHandler::new(f.store.clone());
        handler
            .handle(&f.ctx, Event::new(UNSUBSCRIBE, json!({ "assetClass": "forex" })))
            .await
            .unwrap();

        assert_eq!(f.mailbox.recv().await.unwrap().kind, UNSUBSCRIBED);
        let snapshot = f.store.client_subscriptions(client).await.unwrap();
        assert!(snapshot.forex.is_empty());
        assert_eq!(snapshot.crypto, vec!["BTCUSD"]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_named_tickers() {
        let f = fixture().await;
        let client = f.ctx.client_id();
        let sub = ClientSub::for_client(client)
            .with(AssetClass::Forex, SymbolUpdate::replace(["EURUSD", "GBPUSD"]));
        f.store.set_client_subs(&sub).await.unwrap();

        let handler = UnsubscribeHandler::new(f.store.clone());
        let event = Event::new(
            UNSUBSCRIBE,
            json!({ "assetClass": "forex", "tickers": ["EURUSD"] }),
        );
        handler.handle(&f.ctx, event).await.unwrap();

        assert_eq!(
            f.store
                .client_symbols(client, AssetClass::Forex)
                .await
                .unwrap(),
            vec!["GBPUSD"]
        );
        assert!(
            f.store
                .symbol_subscribers(AssetClass::Forex, "EURUSD")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn set_subscriptions_replies_with_resulting_sets() {
        let mut f = fixture().await;
        let handler = SetSubscriptionsHandler::new(f.store.clone());
        let event = Event::new(
            SET_SUBSCRIPTIONS,
            json!({ "forex": ["USDJPY", "EURUSD"], "equity": [] }),
        );

        handler.handle(&f.ctx, event).await.unwrap();

        let reply = f.mailbox.recv().await.unwrap();
        assert_eq!(reply.kind, SUBSCRIPTIONS);
        assert_eq!(
            reply.payload,
            json!({ "forex": ["EURUSD", "USDJPY"], "equity": [], "crypto": [] })
        );
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_handler_error() {
        let f = fixture().await;
        let mut backend = MockSetStorePort::new();
        backend.expect_execute().returning(|_| {
            Err(StoreError::Connection {
                message: "connection refused".to_string(),
            })
        });
        let store = SubscriptionStore::new(Arc::new(backend), DEFAULT_STORE_TIMEOUT);
        let handler = SubscribeHandler::new(store);

        let event = Event::new(SUBSCRIBE, json!({ "assetClass": "crypto", "tickers": ["BTCUSD"] }));
        let err = handler.handle(&f.ctx, event).await.unwrap_err();

        assert!(matches!(err, HandlerError::Store(_)));
        assert_eq!(err.client_message(), "subscription update failed");
    }

    #[tokio::test]
    async fn disconnect_clears_index() {
        let f = fixture().await;
        let sub = ClientSub::for_client(f.ctx.client_id())
            .with(AssetClass::Equity, SymbolUpdate::replace(["AAPL"]));
        f.store.set_client_subs(&sub).await.unwrap();
        assert_eq!(f.backend.key_count(), 2);

        f.hub.unregister(f.ctx.connection()).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while f.backend.key_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test_case(json!({ "forex": [""] }) ; "empty string")]
    #[test_case(json!({ "forex": ["EURUSD", "  "] }) ; "blank string")]
    #[test_case(json!({ "equity": ["AAPL"], "crypto": ["\t"] }) ; "blank in a later class")]
    #[tokio::test]
    async fn set_subscriptions_rejects_blank_tickers(payload: serde_json::Value) {
        let f = fixture().await;
        let handler = SetSubscriptionsHandler::new(f.store.clone());

        let err = handler
            .handle(&f.ctx, Event::new(SET_SUBSCRIPTIONS, payload))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Rejected(_)));
        assert_eq!(f.backend.key_count(), 0);
    }

    #[tokio::test]
    async fn request_from_evicted_client_is_cleared_when_reader_exits() {
        let backend = Arc::new(InMemorySetStore::new());
        let store = SubscriptionStore::new(backend.clone(), DEFAULT_STORE_TIMEOUT);
        let mut hub = Hub::new();
        register_subscription_handlers(&mut hub, &store);
        let (hub, _task) = hub.start(CancellationToken::new());

        let (conn, _mailbox) = Connection::with_capacity(Uuid::new_v4(), 1);
        hub.register(conn.clone()).await.unwrap();
        let (inbound, frames) = futures::channel::mpsc::unbounded();
        let reader = tokio::spawn(read_pump(conn.clone(), hub.clone(), frames, Keepalive::default()));

        for _ in 0..2 {
            hub.broadcast(Event::pong()).await.unwrap();
        }
        let (sync, _sync_rx) = Connection::new(Uuid::new_v4());
        hub.register(sync).await.unwrap();
        assert!(!hub.is_connected(conn.id()));

        let request = json!({
            "type": SUBSCRIBE,
            "payload": { "assetClass": "forex", "tickers": ["EURUSD"] },
        });
        inbound
            .unbounded_send(Ok(Message::Text(request.to_string().into())))
            .unwrap();

        // The ack cannot be enqueued on the closed mailbox, so the reader stops.
        tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while backend.key_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(backend.snapshot().is_empty());
    }
}
