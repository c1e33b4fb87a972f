//! Connection Hub
//!
//! Single authority over the set of live connections.
//!
//! # Architecture
//!
//! ```text
//!  read pumps ──register/unregister──┐
//!  handlers   ──broadcast/deliver────┼──► intent channel ──► control loop
//!  feeds      ──deliver──────────────┘                          │
//!                                                               ▼
//!                                  RwLock<HashMap<ClientId, Arc<Connection>>>
//!                                          │ try_send (never blocks)
//!                                          ▼
//!                                  per-connection mailbox ──► write pump
//! ```
//!
//! The control loop is the only task that mutates the live set. Readers
//! (`num_clients`, `client_ids`) take the shared lock and run alongside it.
//! A recipient whose mailbox is full during fan-out is evicted: its mailbox
//! is closed and it leaves the live set at once. Disconnect hooks for an
//! evicted client wait for its read pump to unregister.

mod connection;
mod handlers;
mod pump;
mod subscriptions;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

pub use connection::{Connection, MAILBOX_CAPACITY, Mailbox, MailboxError};
pub use handlers::{
    BroadcastHandler, EventHandler, HandlerContext, HandlerError, HandlerRegistry, PingHandler,
};
pub use pump::{Keepalive, read_pump, write_pump};
pub use subscriptions::{
    SetSubscriptionsHandler, SubscribeHandler, SubscriptionCleanup, UnsubscribeHandler,
    register_subscription_handlers,
};

use crate::domain::event::{ClientId, Event};
use crate::infrastructure::metrics::{self, CloseReason};

/// Default capacity of the hub's intent channel.
pub const DEFAULT_INTENT_CAPACITY: usize = 1024;

type ClientMap = Arc<RwLock<HashMap<ClientId, Arc<Connection>>>>;

// =============================================================================
// Errors
// =============================================================================

/// Hub error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// Control loop has exited.
    #[error("hub is not running")]
    Stopped,
}

// =============================================================================
// Disconnect Hooks
// =============================================================================

/// Callback run once per departed client.
///
/// Runs after the client's read pump has unregistered, so no handler for
/// that client runs afterwards, or when the hub stops. Hooks are spawned on
/// their own task; on stop the control loop awaits them.
#[async_trait]
pub trait DisconnectHook: Send + Sync {
    /// Called once per departed client.
    async fn on_disconnect(&self, client: ClientId);
}

// =============================================================================
// Builder
// =============================================================================

/// Un-started hub. Handlers and hooks can only be added here.
pub struct Hub {
    handlers: HandlerRegistry,
    hooks: Vec<Arc<dyn DisconnectHook>>,
    intent_capacity: usize,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("handlers", &self.handlers)
            .field("hooks", &self.hooks.len())
            .field("intent_capacity", &self.intent_capacity)
            .finish()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    /// Create a hub with the built-in `broadcast` and `ping` handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HandlerRegistry::with_builtins(),
            hooks: Vec::new(),
            intent_capacity: DEFAULT_INTENT_CAPACITY,
        }
    }

    /// Set the intent channel capacity.
    #[must_use]
    pub fn with_intent_capacity(mut self, capacity: usize) -> Self {
        self.intent_capacity = capacity.max(1);
        self
    }

    /// Install a handler for an event type, replacing any previous one.
    pub fn register_handler(
        &mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        self.handlers.insert(event_type, handler);
        self
    }

    /// Add a hook run for every client that leaves the live set.
    pub fn on_disconnect(&mut self, hook: Arc<dyn DisconnectHook>) -> &mut Self {
        self.hooks.push(hook);
        self
    }

    /// Registered handlers.
    #[must_use]
    pub const fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Spawn the control loop.
    ///
    /// The loop stops when `shutdown` is cancelled or every handle is
    /// dropped. On stop, every remaining connection is shut down and the
    /// disconnect hooks run for each of them before the task completes.
    #[must_use]
    pub fn start(self, shutdown: CancellationToken) -> (HubHandle, JoinHandle<()>) {
        let (intents_tx, intents_rx) = mpsc::channel(self.intent_capacity);
        let clients: ClientMap = Arc::default();

        let control = ControlLoop {
            intents: intents_rx,
            clients: clients.clone(),
            evicted: HashMap::new(),
            hooks: self.hooks,
            shutdown,
        };
        let task = tokio::spawn(control.run());

        tracing::info!(
            handlers = ?self.handlers.event_types(),
            "Hub started"
        );

        let handle = HubHandle {
            intents: intents_tx,
            clients,
            handlers: Arc::new(self.handlers),
        };
        (handle, task)
    }
}

// =============================================================================
// Handle
// =============================================================================

enum Intent {
    Register {
        conn: Arc<Connection>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        conn: Arc<Connection>,
        ack: oneshot::Sender<()>,
    },
    Broadcast(Arc<Event>),
    Deliver {
        recipients: Vec<ClientId>,
        event: Arc<Event>,
    },
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    intents: mpsc::Sender<Intent>,
    clients: ClientMap,
    handlers: Arc<HandlerRegistry>,
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("clients", &self.num_clients())
            .finish_non_exhaustive()
    }
}

impl HubHandle {
    /// Add a connection to the live set.
    ///
    /// Returns once the control loop has applied it.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Stopped`] if the control loop has exited.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.intents
            .send(Intent::Register { conn, ack })
            .await
            .map_err(|_| HubError::Stopped)?;
        done.await.map_err(|_| HubError::Stopped)
    }

    /// Remove a connection from the live set. Idempotent.
    ///
    /// Closes its mailbox and cancels its pumps. If the hub has already
    /// stopped the connection is closed locally; the stop drain has run
    /// its disconnect hooks.
    pub async fn unregister(&self, conn: &Arc<Connection>) {
        let (ack, done) = oneshot::channel();
        let sent = self
            .intents
            .send(Intent::Unregister {
                conn: conn.clone(),
                ack,
            })
            .await;

        if sent.is_err() || done.await.is_err() {
            conn.close_mailbox();
            conn.shutdown();
        }
    }

    /// Fan an event out to every live client.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Stopped`] if the control loop has exited.
    pub async fn broadcast(&self, event: Event) -> Result<(), HubError> {
        self.intents
            .send(Intent::Broadcast(Arc::new(event)))
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Deliver an event to specific clients. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Stopped`] if the control loop has exited.
    pub async fn deliver(&self, recipients: Vec<ClientId>, event: Event) -> Result<(), HubError> {
        if recipients.is_empty() {
            return Ok(());
        }
        self.intents
            .send(Intent::Deliver {
                recipients,
                event: Arc::new(event),
            })
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Point-in-time number of live clients.
    #[must_use]
    pub fn num_clients(&self) -> usize {
        self.clients.read().len()
    }

    /// Point-in-time ids of live clients.
    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.read().keys().copied().collect()
    }

    /// Whether a client is live.
    #[must_use]
    pub fn is_connected(&self, client: ClientId) -> bool {
        self.clients.read().contains_key(&client)
    }

    /// Frozen handler table.
    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }
}

// =============================================================================
// Control Loop
// =============================================================================

struct ControlLoop {
    intents: mpsc::Receiver<Intent>,
    clients: ClientMap,
    /// Evicted connections whose read pump has not unregistered yet.
    evicted: HashMap<ClientId, Arc<Connection>>,
    hooks: Vec<Arc<dyn DisconnectHook>>,
    shutdown: CancellationToken,
}

impl ControlLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                intent = self.intents.recv() => match intent {
                    Some(intent) => self.apply(intent),
                    None => break,
                },
            }
        }

        let drained: Vec<Arc<Connection>> = self
            .clients
            .write()
            .drain()
            .map(|(_, conn)| conn)
            .chain(self.evicted.drain().map(|(_, conn)| conn))
            .collect();
        for conn in &drained {
            conn.close_mailbox();
            conn.shutdown();
            metrics::record_connection_closed(CloseReason::Shutdown);
        }
        metrics::set_active_clients(0);

        let mut cleanup = JoinSet::new();
        for conn in &drained {
            for hook in &self.hooks {
                let (hook, client) = (hook.clone(), conn.id());
                cleanup.spawn(async move { hook.on_disconnect(client).await });
            }
        }
        while let Some(joined) = cleanup.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Disconnect hook panicked");
            }
        }

        tracing::info!(closed = drained.len(), "Hub stopped");
    }

    fn apply(&mut self, intent: Intent) {
        match intent {
            Intent::Register { conn, ack } => {
                let id = conn.id();
                let total = {
                    let mut clients = self.clients.write();
                    clients.insert(id, conn);
                    clients.len()
                };
                metrics::set_active_clients(total);
                tracing::info!(client_id = %id, total_clients = total, "Client registered");
                let _ = ack.send(());
            }
            Intent::Unregister { conn, ack } => {
                self.unregister(&conn);
                let _ = ack.send(());
            }
            Intent::Broadcast(event) => {
                let started = Instant::now();
                let full = {
                    let clients = self.clients.read();
                    Self::enqueue(clients.values(), &event)
                };
                self.evict(full);
                metrics::record_broadcast(started.elapsed());
            }
            Intent::Deliver { recipients, event } => {
                let started = Instant::now();
                let full = {
                    let clients = self.clients.read();
                    Self::enqueue(recipients.iter().filter_map(|id| clients.get(id)), &event)
                };
                self.evict(full);
                metrics::record_delivery(started.elapsed());
            }
        }
    }

    /// Try each recipient without blocking; return those that refused.
    fn enqueue<'a>(
        recipients: impl Iterator<Item = &'a Arc<Connection>>,
        event: &Arc<Event>,
    ) -> Vec<ClientId> {
        recipients
            .filter(|conn| conn.try_send(event.clone()).is_err())
            .map(|conn| conn.id())
            .collect()
    }

    /// Runs the hooks for every departure, evictions included. The read pump
    /// sends this only after its last handler has returned.
    fn unregister(&mut self, conn: &Arc<Connection>) {
        let removed = {
            let mut clients = self.clients.write();
            let live = clients
                .get(&conn.id())
                .is_some_and(|live| Arc::ptr_eq(live, conn));
            if live { clients.remove(&conn.id()) } else { None }
        };
        let was_evicted = self
            .evicted
            .get(&conn.id())
            .is_some_and(|evicted| Arc::ptr_eq(evicted, conn));
        if was_evicted {
            self.evicted.remove(&conn.id());
        }

        conn.close_mailbox();
        conn.shutdown();

        if removed.is_some() || was_evicted {
            let total = self.clients.read().len();
            metrics::set_active_clients(total);
            tracing::info!(
                client_id = %conn.id(),
                total_clients = total,
                session_secs = (Utc::now() - conn.connected_at()).num_seconds(),
                evicted = was_evicted,
                "Client unregistered"
            );
            self.run_hooks(conn.id());
        }
    }

    fn evict(&mut self, ids: Vec<ClientId>) {
        if ids.is_empty() {
            return;
        }

        let (evicted, total) = {
            let mut clients = self.clients.write();
            let evicted: Vec<Arc<Connection>> =
                ids.iter().filter_map(|id| clients.remove(id)).collect();
            (evicted, clients.len())
        };

        for conn in evicted {
            conn.close_mailbox();
            tracing::warn!(
                client_id = %conn.id(),
                "Evicting slow client, mailbox full"
            );
            metrics::record_evictions(1);
            self.evicted.insert(conn.id(), conn);
        }

        metrics::set_active_clients(total);
    }

    fn run_hooks(&self, client: ClientId) {
        for hook in &self.hooks {
            let hook = hook.clone();
            tokio::spawn(async move { hook.on_disconnect(client).await });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
