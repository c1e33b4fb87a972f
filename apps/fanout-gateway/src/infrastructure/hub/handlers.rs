//! Event Handler Registry
//!
//! Maps an event `type` to the handler that interprets it. Handlers run on
//! the sender's read pump, one event at a time, and may reply to the
//! sender's mailbox, call the subscription store, or publish through the
//! hub. An error returned by a handler is sent back to the sender as an
//! `error` event and never stops the pump.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::connection::{Connection, MailboxError};
use super::{HubError, HubHandle};
use crate::application::ports::StoreError;
use crate::domain::event::{self, ClientId, Event};

// =============================================================================
// Handler Contract
// =============================================================================

/// Everything a handler may touch for one inbound event.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    connection: Arc<Connection>,
    hub: HubHandle,
}

impl HandlerContext {
    /// Build a context for an event from `connection`.
    #[must_use]
    pub const fn new(connection: Arc<Connection>, hub: HubHandle) -> Self {
        Self { connection, hub }
    }

    /// Sender's client id.
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.connection.id()
    }

    /// Sender's connection.
    #[must_use]
    pub const fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Running hub.
    #[must_use]
    pub const fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Enqueue an event on the sender's mailbox without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the mailbox is full or closed.
    pub fn reply(&self, event: Event) -> Result<(), HandlerError> {
        self.connection.try_send(Arc::new(event))?;
        Ok(())
    }
}

/// Handler failure, reported to the sender as an `error` event.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Payload did not match the handler's expected shape.
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// Payload decoded but its content was rejected.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Subscription store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Reply could not be enqueued.
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    /// Hub is no longer running.
    #[error(transparent)]
    Hub(#[from] HubError),
}

impl HandlerError {
    /// Message safe to show the client. Backend detail stays in the logs.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::InvalidPayload(_) => "invalid payload".to_string(),
            Self::Rejected(reason) => reason.clone(),
            Self::Store(_) => "subscription update failed".to_string(),
            Self::Mailbox(_) => "reply could not be delivered".to_string(),
            Self::Hub(_) => "server is shutting down".to_string(),
        }
    }
}

/// Interprets one event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event already stamped with the sender and receipt time.
    async fn handle(&self, ctx: &HandlerContext, event: Event) -> Result<(), HandlerError>;
}

// =============================================================================
// Registry
// =============================================================================

/// Event type name -> handler.
///
/// Filled while the hub is being built and frozen behind an `Arc` once it
/// starts, so dispatch never contends with registration.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.event_types())
            .finish()
    }
}

impl HandlerRegistry {
    /// Registry holding the built-in `broadcast` and `ping` handlers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.insert(event::BROADCAST, Arc::new(BroadcastHandler));
        registry.insert(event::PING, Arc::new(PingHandler));
        registry
    }

    /// Install a handler, replacing any previous one for the same type.
    pub fn insert(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_type = event_type.into();
        if self.handlers.insert(event_type.clone(), handler).is_some() {
            tracing::debug!(event_type = %event_type, "Replaced event handler");
        }
    }

    /// Handler for a type, if any.
    #[must_use]
    pub fn get(&self, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(event_type)
    }

    /// Whether a type has a handler.
    #[must_use]
    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Registered type names, sorted.
    #[must_use]
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// =============================================================================
// Built-in Handlers
// =============================================================================

/// Re-publishes the event to every live client, sender included.
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastHandler;

#[async_trait]
impl EventHandler for BroadcastHandler {
    async fn handle(&self, ctx: &HandlerContext, event: Event) -> Result<(), HandlerError> {
        ctx.hub().broadcast(event).await?;
        Ok(())
    }
}

/// Answers `ping` with `pong` to the sender only.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingHandler;

#[async_trait]
impl EventHandler for PingHandler {
    async fn handle(&self, ctx: &HandlerContext, _event: Event) -> Result<(), HandlerError> {
        ctx.reply(Event::pong())
    }
}
