//! Connection Pumps
//!
//! Each live connection runs two tasks:
//!
//! - **read pump**: decodes inbound frames one at a time, stamps them and
//!   dispatches to the handler registry
//! - **write pump**: drains the mailbox onto the socket and sends keepalive
//!   pings
//!
//! Whichever pump stops first cancels the connection's token and the other
//! follows. Only the read pump asks the hub to unregister.
//!
//! Both pumps are generic over the socket halves so they can be driven by
//! in-memory channels in tests.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::Instant;

use super::connection::{Connection, Mailbox, MailboxError};
use super::handlers::HandlerContext;
use super::HubHandle;
use crate::domain::event::Event;
use crate::infrastructure::metrics::{self, CloseReason};

// =============================================================================
// Keepalive
// =============================================================================

/// Socket deadlines and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Deadline for a single outbound send.
    pub write_wait: Duration,
    /// Inactivity deadline on the read side.
    pub pong_wait: Duration,
    /// Interval between pings. Shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
}

impl Keepalive {
    /// Deadlines used in production.
    pub const STANDARD: Self = Self {
        write_wait: Duration::from_secs(10),
        pong_wait: Duration::from_secs(60),
        ping_period: Duration::from_secs(54),
        max_message_size: 8192,
    };
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::STANDARD
    }
}

// =============================================================================
// Read Pump
// =============================================================================

/// Run the read side of a connection until it closes.
///
/// Stops on socket error or close, on a frame that is oversized or not a
/// valid event, when nothing arrives within `pong_wait`, when a reply
/// cannot be enqueued, or when the connection is shut down elsewhere. On
/// exit it unregisters the connection from the hub.
pub async fn read_pump<S>(
    conn: Arc<Connection>,
    hub: HubHandle,
    mut stream: S,
    keepalive: Keepalive,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(keepalive.pong_wait);
    tokio::pin!(deadline);

    let reason = loop {
        tokio::select! {
            () = conn.done().cancelled() => break None,
            () = &mut deadline => break Some(CloseReason::ReadTimeout),
            frame = stream.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        tracing::debug!(client_id = %conn.id(), error = %e, "Socket read failed");
                        break Some(CloseReason::Disconnected);
                    }
                    None => break Some(CloseReason::Disconnected),
                };

                deadline.as_mut().reset(Instant::now() + keepalive.pong_wait);

                let decoded = match message {
                    Message::Text(text) => decode(&conn, text.as_str().as_bytes(), keepalive),
                    Message::Binary(bytes) => decode(&conn, &bytes, keepalive),
                    Message::Close(_) => break Some(CloseReason::Disconnected),
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                let Some(event) = decoded else {
                    break Some(CloseReason::Protocol);
                };

                if let Err(e) = dispatch(&conn, &hub, event.stamp(conn.id())).await {
                    tracing::warn!(client_id = %conn.id(), error = %e, "Reply not delivered, closing");
                    break Some(CloseReason::Backpressure);
                }
            }
        }
    };

    if let Some(reason) = reason {
        metrics::record_connection_closed(reason);
        tracing::info!(client_id = %conn.id(), reason = reason.as_str(), "Connection closing");
    }

    hub.unregister(&conn).await;
    conn.shutdown();
}

fn decode(conn: &Connection, raw: &[u8], keepalive: Keepalive) -> Option<Event> {
    if raw.len() > keepalive.max_message_size {
        tracing::warn!(
            client_id = %conn.id(),
            size = raw.len(),
            limit = keepalive.max_message_size,
            "Inbound message too large"
        );
        return None;
    }

    match serde_json::from_slice::<Event>(raw) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(client_id = %conn.id(), error = %e, "Malformed inbound event");
            None
        }
    }
}

async fn dispatch(
    conn: &Arc<Connection>,
    hub: &HubHandle,
    event: Event,
) -> Result<(), MailboxError> {
    let kind = event.kind.clone();

    let Some(handler) = hub.handlers().get(&kind) else {
        tracing::debug!(client_id = %conn.id(), event_type = %kind, "Unknown event type");
        metrics::record_unknown_event();
        return conn.try_send(Arc::new(Event::unknown(&kind)));
    };

    metrics::record_event_received(&kind);
    let ctx = HandlerContext::new(conn.clone(), hub.clone());
    if let Err(e) = handler.handle(&ctx, event).await {
        tracing::warn!(
            client_id = %conn.id(),
            event_type = %kind,
            error = %e,
            "Event handler failed"
        );
        metrics::record_handler_error(&kind);
        return conn.try_send(Arc::new(Event::error(e.client_message())));
    }

    Ok(())
}

// =============================================================================
// Write Pump
// =============================================================================

/// Run the write side of a connection until it closes.
///
/// Stops when the connection is shut down, when the mailbox is closed and
/// drained (after sending a close frame), or when a send fails or misses
/// `write_wait`. Always shuts the connection down and closes the sink.
pub async fn write_pump<S>(
    conn: Arc<Connection>,
    mut mailbox: Mailbox,
    mut sink: S,
    keepalive: Keepalive,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ticker =
        tokio::time::interval_at(Instant::now() + keepalive.ping_period, keepalive.ping_period);

    let reason = loop {
        tokio::select! {
            () = conn.done().cancelled() => break None,
            next = mailbox.recv() => {
                let Some(event) = next else {
                    let _ = send(&mut sink, Message::Close(None), keepalive.write_wait).await;
                    break None;
                };
                let text = match serde_json::to_string(event.as_ref()) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(client_id = %conn.id(), error = %e, "Dropping unencodable event");
                        continue;
                    }
                };
                let frame = Message::Text(text.into());
                if let Err(reason) = send(&mut sink, frame, keepalive.write_wait).await {
                    break Some(reason);
                }
            }
            _ = ticker.tick() => {
                let frame = Message::Ping(Bytes::new());
                if let Err(reason) = send(&mut sink, frame, keepalive.write_wait).await {
                    break Some(reason);
                }
            }
        }
    };

    if let Some(reason) = reason {
        metrics::record_connection_closed(reason);
        tracing::info!(client_id = %conn.id(), reason = reason.as_str(), "Connection closing");
    }

    conn.shutdown();
    if let Err(e) = sink.close().await {
        tracing::debug!(client_id = %conn.id(), error = %e, "Socket close failed");
    }
}

async fn send<S>(sink: &mut S, message: Message, wait: Duration) -> Result<(), CloseReason>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout(wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Socket write failed");
            Err(CloseReason::Disconnected)
        }
        Err(_) => Err(CloseReason::WriteTimeout),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::channel::mpsc as channel;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::domain::event::{self, ERROR, PONG, UNKNOWN_EVENT};
    use crate::infrastructure::hub::{EventHandler, HandlerError, Hub};

    type Inbound = channel::UnboundedSender<Result<Message, axum::Error>>;

    const WAIT: Duration = Duration::from_secs(1);

    fn text(raw: &str) -> Result<Message, axum::Error> {
        Ok(Message::Text(raw.into()))
    }

    async fn connect(hub: &HubHandle) -> (Arc<Connection>, Mailbox) {
        let (conn, rx) = Connection::new(Uuid::new_v4());
        hub.register(conn.clone()).await.unwrap();
        (conn, rx)
    }

    fn spawn_reader(
        conn: &Arc<Connection>,
        hub: &HubHandle,
        keepalive: Keepalive,
    ) -> (Inbound, tokio::task::JoinHandle<()>) {
        let (tx, rx) = channel::unbounded();
        let task = tokio::spawn(read_pump(conn.clone(), hub.clone(), rx, keepalive));
        (tx, task)
    }

    #[tokio::test]
    async fn ping_is_answered_only_to_sender() {
        let (hub, _task) = Hub::new().start(CancellationToken::new());
        let (sender, mut sender_rx) = connect(&hub).await;
        let (_other, mut other_rx) = connect(&hub).await;

        let (inbound, _reader) = spawn_reader(&sender, &hub, Keepalive::default());
        inbound.unbounded_send(text(r#"{"type":"ping"}"#)).unwrap();

        let reply = tokio::time::timeout(WAIT, sender_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, PONG);
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_type_gets_exactly_one_reply() {
        let (hub, _task) = Hub::new().start(CancellationToken::new());
        let (conn, mut rx) = connect(&hub).await;

        let (inbound, reader) = spawn_reader(&conn, &hub, Keepalive::default());
        inbound
            .unbounded_send(text(r#"{"type":"teleport","payload":{}}"#))
            .unwrap();
        drop(inbound);
        reader.await.unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, UNKNOWN_EVENT);
        assert_eq!(reply.payload["type"], "teleport");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn broadcast_is_stamped_with_sender() {
        let (hub, _task) = Hub::new().start(CancellationToken::new());
        let (sender, _sender_rx) = connect(&hub).await;
        let (_other, mut other_rx) = connect(&hub).await;
        let forged = Uuid::new_v4();

        let (inbound, _reader) = spawn_reader(&sender, &hub, Keepalive::default());
        inbound
            .unbounded_send(text(&format!(
                r#"{{"type":"broadcast","payload":{{"msg":"hi"}},"from":"{forged}"}}"#
            )))
            .unwrap();

        let received = tokio::time::timeout(WAIT, other_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.kind, event::BROADCAST);
        assert_eq!(received.from, Some(sender.id()));
        assert_eq!(received.payload["msg"], "hi");
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _ctx: &HandlerContext, _event: Event) -> Result<(), HandlerError> {
            Err(HandlerError::Rejected("tickers must not be empty".to_string()))
        }
    }

    #[tokio::test]
    async fn handler_error_is_reported_and_connection_stays() {
        let mut hub = Hub::new();
        hub.register_handler("fail", Arc::new(Failing));
        let (hub, _task) = hub.start(CancellationToken::new());
        let (conn, mut rx) = connect(&hub).await;

        let (inbound, _reader) = spawn_reader(&conn, &hub, Keepalive::default());
        inbound.unbounded_send(text(r#"{"type":"fail"}"#)).unwrap();
        inbound.unbounded_send(text(r#"{"type":"ping"}"#)).unwrap();

        let first = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.kind, ERROR);
        assert_eq!(first.payload["message"], "tickers must not be empty");

        let second = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.kind, PONG);
        assert!(hub.is_connected(conn.id()));
    }

    #[tokio::test]
    async fn malformed_input_closes_only_that_connection() {
        let (hub, _task) = Hub::new().start(CancellationToken::new());
        let (bad, _bad_rx) = connect(&hub).await;
        let (good, _good_rx) = connect(&hub).await;

        let (inbound, reader) = spawn_reader(&bad, &hub, Keepalive::default());
        inbound.unbounded_send(text("{not json")).unwrap();
        tokio::time::timeout(WAIT, reader).await.unwrap().unwrap();

        assert!(bad.is_shutdown());
        assert!(!hub.is_connected(bad.id()));
        assert!(hub.is_connected(good.id()));
        assert!(!good.is_shutdown());
    }

    #[tokio::test]
    async fn oversized_message_closes_connection() {
        let (hub, _task) = Hub::new().start(CancellationToken::new());
        let (conn, _rx) = connect(&hub).await;

        let (inbound, reader) = spawn_reader(&conn, &hub, Keepalive::default());
        let padding = "x".repeat(Keepalive::STANDARD.max_message_size);
        inbound
            .unbounded_send(text(&format!(r#"{{"type":"ping","payload":"{padding}"}}"#)))
            .unwrap();
        tokio::time::timeout(WAIT, reader).await.unwrap().unwrap();

        assert_eq!(hub.num_clients(), 0);
    }

    #[tokio::test]
    async fn silent_peer_hits_read_deadline() {
        let (hub, _task) = Hub::new().start(CancellationToken::new());
        let (conn, _rx) = connect(&hub).await;
        let keepalive = Keepalive {
            pong_wait: Duration::from_millis(50),
            ..Keepalive::default()
        };

        let (_inbound, reader) = spawn_reader(&conn, &hub, keepalive);
        tokio::time::timeout(WAIT, reader).await.unwrap().unwrap();

        assert!(conn.is_shutdown());
        assert_eq!(hub.num_clients(), 0);
    }

    #[tokio::test]
    async fn pong_extends_read_deadline() {
        let (hub, _task) = Hub::new().start(CancellationToken::new());
        let (conn, _rx) = connect(&hub).await;
        let keepalive = Keepalive {
            pong_wait: Duration::from_millis(200),
            ..Keepalive::default()
        };

        let (inbound, _reader) = spawn_reader(&conn, &hub, keepalive);
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            inbound
                .unbounded_send(Ok(Message::Pong(Bytes::new())))
                .unwrap();
        }

        assert!(hub.is_connected(conn.id()));
    }

    #[tokio::test]
    async fn writer_drains_mailbox_then_sends_close() {
        let (conn, mailbox) = Connection::new(Uuid::new_v4());
        let (sink, mut wire) = channel::unbounded::<Message>();

        conn.try_send(Arc::new(Event::pong())).unwrap();
        conn.try_send(Arc::new(Event::error("boom"))).unwrap();
        conn.close_mailbox();

        tokio::time::timeout(WAIT, write_pump(conn.clone(), mailbox, sink, Keepalive::default()))
            .await
            .unwrap();

        let mut frames = Vec::new();
        while let Some(frame) = wire.next().await {
            frames.push(frame);
        }

        assert_eq!(frames.len(), 3);
        let Message::Text(first) = &frames[0] else {
            panic!("expected text frame, got {:?}", frames[0]);
        };
        let first: Event = serde_json::from_str(first.as_str()).unwrap();
        assert_eq!(first.kind, PONG);
        assert!(matches!(frames[2], Message::Close(None)));
        assert!(conn.is_shutdown());
    }

    #[tokio::test]
    async fn writer_sends_keepalive_pings() {
        let (conn, mailbox) = Connection::new(Uuid::new_v4());
        let (sink, mut wire) = channel::unbounded::<Message>();
        let keepalive = Keepalive {
            ping_period: Duration::from_millis(20),
            ..Keepalive::default()
        };

        let writer = tokio::spawn(write_pump(conn.clone(), mailbox, sink, keepalive));
        let frame = tokio::time::timeout(WAIT, wire.next()).await.unwrap().unwrap();
        assert!(matches!(frame, Message::Ping(_)));

        conn.shutdown();
        tokio::time::timeout(WAIT, writer).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn writer_stops_when_peer_is_gone() {
        let (conn, mailbox) = Connection::new(Uuid::new_v4());
        let (sink, wire) = channel::unbounded::<Message>();
        drop(wire);

        conn.try_send(Arc::new(Event::pong())).unwrap();
        tokio::time::timeout(WAIT, write_pump(conn.clone(), mailbox, sink, Keepalive::default()))
            .await
            .unwrap();

        assert!(conn.is_shutdown());
    }
}
