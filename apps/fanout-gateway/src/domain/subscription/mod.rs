//! Subscription Types
//!
//! Domain types describing which symbols a client wants, per asset class,
//! and the key layout of the bidirectional index that stores them.
//!
//! # Design
//!
//! Two key families per asset class:
//! - `client:{client_id}:{asset}` - forward set, symbols one client wants
//! - `symbol:{asset}:{symbol}` - reverse set, clients wanting one symbol
//!
//! A client is in a symbol's reverse set iff the symbol is in the client's
//! forward set for that asset class.
//!
//! Partial updates are expressed per asset class with [`SymbolUpdate`],
//! which keeps "leave alone", "clear" and "replace" distinct.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::event::ClientId;

// =============================================================================
// Types
// =============================================================================

/// A symbol string (forex pair, equity ticker, crypto pair).
pub type Symbol = String;

/// Prefix of forward-index keys.
pub const CLIENT_KEY_PREFIX: &str = "client";

/// Prefix of reverse-index keys.
pub const SYMBOL_KEY_PREFIX: &str = "symbol";

/// Asset classes a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    /// Foreign-exchange pairs.
    Forex,
    /// Equities.
    Equity,
    /// Crypto pairs.
    Crypto,
}

impl AssetClass {
    /// Get all asset classes.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Forex, Self::Equity, Self::Crypto]
    }

    /// Short token used inside store keys.
    #[must_use]
    pub const fn key_name(self) -> &'static str {
        match self {
            Self::Forex => "fx",
            Self::Equity => "iex",
            Self::Crypto => "crypto",
        }
    }

    /// Name used in client payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Forex => "forex",
            Self::Equity => "equity",
            Self::Crypto => "crypto",
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forward-index key: `client:{client_id}:{asset}`.
#[must_use]
pub fn client_key(client: ClientId, asset: AssetClass) -> String {
    format!("{CLIENT_KEY_PREFIX}:{client}:{}", asset.key_name())
}

/// Reverse-index key: `symbol:{asset}:{symbol}`.
#[must_use]
pub fn symbol_key(asset: AssetClass, symbol: &str) -> String {
    format!("{SYMBOL_KEY_PREFIX}:{}:{symbol}", asset.key_name())
}

// =============================================================================
// Symbol Update
// =============================================================================

/// Requested change to one asset class of a client's subscriptions.
///
/// On the wire an absent (or `null`) field is [`SymbolUpdate::Unchanged`],
/// `[]` is [`SymbolUpdate::Clear`] and a non-empty list is
/// [`SymbolUpdate::Replace`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<Vec<Symbol>>", into = "Option<Vec<Symbol>>")]
pub enum SymbolUpdate {
    /// Leave this asset class as it is.
    #[default]
    Unchanged,
    /// Drop every symbol of this asset class.
    Clear,
    /// Hold exactly these symbols (never empty).
    Replace(Vec<Symbol>),
}

impl SymbolUpdate {
    /// Build an update from a list, mapping an empty list to [`Self::Clear`].
    #[must_use]
    pub fn replace(symbols: impl IntoIterator<Item = impl Into<Symbol>>) -> Self {
        let symbols: Vec<Symbol> = symbols.into_iter().map(Into::into).collect();
        if symbols.is_empty() {
            Self::Clear
        } else {
            Self::Replace(symbols)
        }
    }

    /// Whether this asset class is left untouched.
    #[must_use]
    pub const fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }

    /// Target symbols, or `None` when unchanged.
    #[must_use]
    pub fn symbols(&self) -> Option<&[Symbol]> {
        match self {
            Self::Unchanged => None,
            Self::Clear => Some(&[]),
            Self::Replace(symbols) => Some(symbols),
        }
    }
}

impl From<Option<Vec<Symbol>>> for SymbolUpdate {
    fn from(value: Option<Vec<Symbol>>) -> Self {
        value.map_or(Self::Unchanged, Self::replace)
    }
}

impl From<SymbolUpdate> for Option<Vec<Symbol>> {
    fn from(value: SymbolUpdate) -> Self {
        match value {
            SymbolUpdate::Unchanged => None,
            SymbolUpdate::Clear => Some(Vec::new()),
            SymbolUpdate::Replace(symbols) => Some(symbols),
        }
    }
}

// =============================================================================
// Client Subscription Record
// =============================================================================

/// Per-client subscription request, one [`SymbolUpdate`] per asset class.
///
/// The client id never comes from the wire; handlers fill it from the
/// connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSub {
    /// Owning client.
    #[serde(skip)]
    pub id: ClientId,
    /// Forex symbols.
    #[serde(default, skip_serializing_if = "SymbolUpdate::is_unchanged")]
    pub forex: SymbolUpdate,
    /// Equity symbols.
    #[serde(default, skip_serializing_if = "SymbolUpdate::is_unchanged")]
    pub equity: SymbolUpdate,
    /// Crypto symbols.
    #[serde(default, skip_serializing_if = "SymbolUpdate::is_unchanged")]
    pub crypto: SymbolUpdate,
}

impl ClientSub {
    /// Empty record for a client: every asset class unchanged.
    #[must_use]
    pub fn for_client(id: ClientId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Set the update for one asset class.
    #[must_use]
    pub fn with(mut self, asset: AssetClass, update: SymbolUpdate) -> Self {
        *self.get_mut(asset) = update;
        self
    }

    /// Update requested for an asset class.
    #[must_use]
    pub const fn get(&self, asset: AssetClass) -> &SymbolUpdate {
        match asset {
            AssetClass::Forex => &self.forex,
            AssetClass::Equity => &self.equity,
            AssetClass::Crypto => &self.crypto,
        }
    }

    const fn get_mut(&mut self, asset: AssetClass) -> &mut SymbolUpdate {
        match asset {
            AssetClass::Forex => &mut self.forex,
            AssetClass::Equity => &mut self.equity,
            AssetClass::Crypto => &mut self.crypto,
        }
    }
}

// =============================================================================
// Wire Payloads
// =============================================================================

/// Payload of `subscribe` / `unsubscribe` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    /// Asset class the tickers belong to.
    pub asset_class: AssetClass,
    /// Symbols to add or remove.
    #[serde(default)]
    pub tickers: Vec<Symbol>,
}

/// A client's current symbols across all asset classes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    /// Forex symbols, sorted.
    pub forex: Vec<Symbol>,
    /// Equity symbols, sorted.
    pub equity: Vec<Symbol>,
    /// Crypto symbols, sorted.
    pub crypto: Vec<Symbol>,
}

impl SubscriptionSnapshot {
    /// Store the symbols for an asset class, sorted for stable output.
    pub fn set(&mut self, asset: AssetClass, mut symbols: Vec<Symbol>) {
        symbols.sort_unstable();
        match asset {
            AssetClass::Forex => self.forex = symbols,
            AssetClass::Equity => self.equity = symbols,
            AssetClass::Crypto => self.crypto = symbols,
        }
    }

    /// Whether no asset class holds a symbol.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forex.is_empty() && self.equity.is_empty() && self.crypto.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;
    use uuid::Uuid;

    use super::*;

    #[test_case(AssetClass::Forex, "fx", "forex")]
    #[test_case(AssetClass::Equity, "iex", "equity")]
    #[test_case(AssetClass::Crypto, "crypto", "crypto")]
    fn asset_class_names(asset: AssetClass, key: &str, wire: &str) {
        assert_eq!(asset.key_name(), key);
        assert_eq!(asset.as_str(), wire);
        assert_eq!(serde_json::to_string(&asset).unwrap(), format!("\"{wire}\""));
    }

    #[test]
    fn key_layout() {
        let id = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(
            client_key(id, AssetClass::Forex),
            "client:67e55044-10b1-426f-9247-bb680e5fe0c8:fx"
        );
        assert_eq!(symbol_key(AssetClass::Forex, "EURUSD"), "symbol:fx:EURUSD");
        assert_eq!(symbol_key(AssetClass::Equity, "AAPL"), "symbol:iex:AAPL");
    }

    #[test]
    fn three_valued_fields_from_json() {
        let sub: ClientSub =
            serde_json::from_str(r#"{"forex":["EURUSD"],"equity":[],"crypto":null}"#).unwrap();

        assert_eq!(sub.forex, SymbolUpdate::Replace(vec!["EURUSD".to_string()]));
        assert_eq!(sub.equity, SymbolUpdate::Clear);
        assert_eq!(sub.crypto, SymbolUpdate::Unchanged);
    }

    #[test]
    fn absent_fields_are_unchanged() {
        let sub: ClientSub = serde_json::from_str("{}").unwrap();
        for asset in AssetClass::all() {
            assert!(sub.get(*asset).is_unchanged());
        }
    }

    #[test]
    fn client_id_is_not_taken_from_wire() {
        let sub: ClientSub =
            serde_json::from_str(r#"{"id":"67e55044-10b1-426f-9247-bb680e5fe0c8"}"#).unwrap();
        assert!(sub.id.is_nil());
    }

    #[test]
    fn serialization_skips_unchanged() {
        let sub = ClientSub::for_client(Uuid::new_v4())
            .with(AssetClass::Crypto, SymbolUpdate::Clear);
        let json = serde_json::to_value(&sub).unwrap();
        assert_eq!(json, serde_json::json!({ "crypto": [] }));
    }

    #[test]
    fn replace_with_empty_list_is_clear() {
        assert_eq!(SymbolUpdate::replace(Vec::<String>::new()), SymbolUpdate::Clear);
        assert_eq!(SymbolUpdate::Clear.symbols(), Some(&[][..]));
        assert_eq!(SymbolUpdate::Unchanged.symbols(), None);
    }

    #[test]
    fn subscribe_payload_uses_camel_case() {
        let payload: SubscribePayload =
            serde_json::from_str(r#"{"assetClass":"equity","tickers":["AAPL","MSFT"]}"#).unwrap();
        assert_eq!(payload.asset_class, AssetClass::Equity);
        assert_eq!(payload.tickers, vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn snapshot_sorts_symbols() {
        let mut snapshot = SubscriptionSnapshot::default();
        assert!(snapshot.is_empty());

        snapshot.set(
            AssetClass::Forex,
            vec!["USDJPY".to_string(), "EURUSD".to_string()],
        );

        assert_eq!(snapshot.forex, vec!["EURUSD", "USDJPY"]);
        assert!(!snapshot.is_empty());
    }
}
