//! Redis set store.
//!
//! One connection is opened at startup and shared by every caller: a
//! multiplexed connection for a single node, or a cluster connection when
//! several nodes are configured.
//!
//! On a single node a batch is sent as one non-atomic pipeline. A cluster
//! cannot pipeline keys that live in different slots, and the reverse index
//! spreads one client's symbols across slots, so there every command is
//! sent on its own and the batch fails if any of them fails.

use async_trait::async_trait;
use futures::future::join_all;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, FromRedisValue, RedisError, RedisResult};

use crate::application::ports::{SetBatch, SetCommand, SetStorePort, StoreError};

#[derive(Clone)]
enum Link {
    Single(MultiplexedConnection),
    Cluster(ClusterConnection),
}

/// Redis-backed implementation of [`SetStorePort`].
#[derive(Clone)]
pub struct RedisSetStore {
    link: Link,
}

impl std::fmt::Debug for RedisSetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.link {
            Link::Single(_) => "single",
            Link::Cluster(_) => "cluster",
        };
        f.debug_struct("RedisSetStore")
            .field("mode", &mode)
            .finish_non_exhaustive()
    }
}

impl RedisSetStore {
    /// Connect to the configured nodes.
    ///
    /// One node opens a multiplexed connection; more than one opens a
    /// cluster connection seeded with all of them.
    ///
    /// # Errors
    ///
    /// Returns an error if a URL is invalid or no node is reachable.
    pub async fn connect(nodes: &[String]) -> Result<Self, StoreError> {
        match nodes {
            [url] => Self::connect_single(url).await,
            _ => Self::connect_cluster(nodes).await,
        }
    }

    /// Open a multiplexed connection to one node.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect_single(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| connection_error(&e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| connection_error(&e))?;

        tracing::info!("Connected to Redis subscription store");
        Ok(Self {
            link: Link::Single(conn),
        })
    }

    /// Open a cluster connection seeded with `nodes`.
    ///
    /// # Errors
    ///
    /// Returns an error if no node is given, a URL is invalid, or the
    /// cluster cannot be reached.
    pub async fn connect_cluster(nodes: &[String]) -> Result<Self, StoreError> {
        let client = ClusterClient::new(nodes.to_vec()).map_err(|e| connection_error(&e))?;
        let conn = client
            .get_async_connection()
            .await
            .map_err(|e| connection_error(&e))?;

        tracing::info!(nodes = nodes.len(), "Connected to Redis Cluster subscription store");
        Ok(Self {
            link: Link::Cluster(conn),
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> RedisResult<T> {
        match &self.link {
            Link::Single(conn) => {
                let mut conn = conn.clone();
                cmd.query_async(&mut conn).await
            }
            Link::Cluster(conn) => {
                let mut conn = conn.clone();
                cmd.query_async(&mut conn).await
            }
        }
    }
}

/// The Redis command for one batch entry.
fn command(entry: &SetCommand) -> Cmd {
    match entry {
        SetCommand::Add { key, members } => {
            let mut cmd = redis::cmd("SADD");
            cmd.arg(key).arg(members);
            cmd
        }
        SetCommand::Remove { key, member } => {
            let mut cmd = redis::cmd("SREM");
            cmd.arg(key).arg(member);
            cmd
        }
        SetCommand::Delete { key } => {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(key);
            cmd
        }
    }
}

fn connection_error(err: &RedisError) -> StoreError {
    StoreError::Connection {
        message: err.to_string(),
    }
}

fn store_error(err: &RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        connection_error(err)
    } else {
        StoreError::Command {
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl SetStorePort for RedisSetStore {
    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        self.query(&cmd).await.map_err(|e| store_error(&e))
    }

    async fn execute(&self, batch: SetBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        match &self.link {
            Link::Single(conn) => {
                let mut pipe = redis::pipe();
                for entry in batch.commands() {
                    pipe.add_command(command(entry)).ignore();
                }

                let mut conn = conn.clone();
                let _: () = pipe.query_async(&mut conn).await.map_err(|e| {
                    tracing::warn!(
                        commands = batch.len(),
                        error = %e,
                        "Redis pipeline failed, index may be partially applied"
                    );
                    store_error(&e)
                })?;
            }
            Link::Cluster(_) => {
                let sent = batch.commands().iter().map(|entry| async move {
                    let _: () = self.query(&command(entry)).await?;
                    Ok::<(), RedisError>(())
                });
                let failed: Vec<RedisError> = join_all(sent)
                    .await
                    .into_iter()
                    .filter_map(Result::err)
                    .collect();

                if let Some(first) = failed.first() {
                    tracing::warn!(
                        commands = batch.len(),
                        failed = failed.len(),
                        error = %first,
                        "Redis cluster batch failed, index may be partially applied"
                    );
                    return Err(store_error(first));
                }
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = self
            .query(&redis::cmd("PING"))
            .await
            .map_err(|e| store_error(&e))?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sends_every_member() {
        let cmd = command(&SetCommand::Add {
            key: "client:c1:fx".to_string(),
            members: vec!["EURUSD".to_string(), "GBPUSD".to_string()],
        });
        assert_eq!(
            cmd.get_packed_command(),
            b"*4\r\n$4\r\nSADD\r\n$12\r\nclient:c1:fx\r\n$6\r\nEURUSD\r\n$6\r\nGBPUSD\r\n"
        );
    }

    #[test]
    fn remove_and_delete_are_single_key() {
        let srem = command(&SetCommand::Remove {
            key: "symbol:fx:EURUSD".to_string(),
            member: "c1".to_string(),
        });
        assert_eq!(
            srem.get_packed_command(),
            b"*3\r\n$4\r\nSREM\r\n$16\r\nsymbol:fx:EURUSD\r\n$2\r\nc1\r\n"
        );

        let del = command(&SetCommand::Delete {
            key: "client:c1:fx".to_string(),
        });
        assert_eq!(
            del.get_packed_command(),
            b"*2\r\n$3\r\nDEL\r\n$12\r\nclient:c1:fx\r\n"
        );
    }

    #[tokio::test]
    async fn cluster_needs_a_node() {
        let err = RedisSetStore::connect(&[]).await.unwrap_err();
        assert!(matches!(err, StoreError::Connection { .. }));
    }
}
