//! Live Connection
//!
//! One per upgraded socket. Holds the client id, the sending half of the
//! bounded outbound mailbox, and the cancellation token shared by the two
//! pumps.
//!
//! The mailbox sender lives behind a lock so the hub can close it while
//! handlers still hold the connection. Once closed, the write pump drains
//! what is left and sends a close frame.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::domain::event::{ClientId, Event};

/// Outbound mailbox capacity per connection.
pub const MAILBOX_CAPACITY: usize = 256;

/// Receiving half of a connection's mailbox, owned by the write pump.
pub type Mailbox = mpsc::Receiver<Arc<Event>>;

/// Enqueue failure on a connection's mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
    /// Mailbox is at capacity.
    #[error("mailbox full")]
    Full,
    /// Mailbox was closed by the hub or the write pump is gone.
    #[error("mailbox closed")]
    Closed,
}

/// A live client connection.
#[derive(Debug)]
pub struct Connection {
    id: ClientId,
    mailbox: RwLock<Option<mpsc::Sender<Arc<Event>>>>,
    done: CancellationToken,
    connected_at: DateTime<Utc>,
}

impl Connection {
    /// Create a connection with a fresh mailbox of [`MAILBOX_CAPACITY`].
    #[must_use]
    pub fn new(id: ClientId) -> (Arc<Self>, Mailbox) {
        Self::with_capacity(id, MAILBOX_CAPACITY)
    }

    /// Create a connection with a custom mailbox capacity.
    #[must_use]
    pub fn with_capacity(id: ClientId, capacity: usize) -> (Arc<Self>, Mailbox) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Arc::new(Self {
            id,
            mailbox: RwLock::new(Some(tx)),
            done: CancellationToken::new(),
            connected_at: Utc::now(),
        });
        (conn, rx)
    }

    /// Client identifier.
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// When the upgrade completed.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Non-blocking enqueue onto the mailbox.
    ///
    /// # Errors
    ///
    /// Returns [`MailboxError::Full`] at capacity and [`MailboxError::Closed`]
    /// once the mailbox has been closed.
    pub fn try_send(&self, event: Arc<Event>) -> Result<(), MailboxError> {
        let guard = self.mailbox.read();
        let Some(tx) = guard.as_ref() else {
            return Err(MailboxError::Closed);
        };
        tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => MailboxError::Full,
            TrySendError::Closed(_) => MailboxError::Closed,
        })
    }

    /// Whether the mailbox still accepts events.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.mailbox.read().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Close the mailbox. Returns `false` if it was already closed.
    pub(crate) fn close_mailbox(&self) -> bool {
        self.mailbox.write().take().is_some()
    }

    /// Signal both pumps to stop.
    pub fn shutdown(&self) {
        self.done.cancel();
    }

    /// Whether [`Connection::shutdown`] has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Token cancelled on shutdown.
    #[must_use]
    pub const fn done(&self) -> &CancellationToken {
        &self.done
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn full_mailbox_reports_full() {
        let (conn, _rx) = Connection::with_capacity(Uuid::new_v4(), 1);
        let event = Arc::new(Event::pong());

        assert!(conn.try_send(event.clone()).is_ok());
        assert_eq!(conn.try_send(event), Err(MailboxError::Full));
    }

    #[tokio::test]
    async fn closed_mailbox_drains_then_ends() {
        let (conn, mut rx) = Connection::new(Uuid::new_v4());
        conn.try_send(Arc::new(Event::pong())).unwrap();

        assert!(conn.close_mailbox());
        assert!(!conn.close_mailbox());
        assert!(!conn.is_open());
        assert_eq!(
            conn.try_send(Arc::new(Event::pong())),
            Err(MailboxError::Closed)
        );

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn dropped_receiver_reports_closed() {
        let (conn, rx) = Connection::new(Uuid::new_v4());
        drop(rx);
        assert_eq!(
            conn.try_send(Arc::new(Event::pong())),
            Err(MailboxError::Closed)
        );
    }

    #[test]
    fn shutdown_cancels_token() {
        let (conn, _rx) = Connection::new(Uuid::new_v4());
        assert!(!conn.is_shutdown());
        conn.shutdown();
        assert!(conn.done().is_cancelled());
    }
}
