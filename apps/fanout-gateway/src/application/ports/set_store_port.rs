//! Set Store Port (Driven Port)
//!
//! Interface for a key -> set-of-strings store. Redis is the production
//! backend; an in-memory map serves tests and single-node deployments.

use async_trait::async_trait;

// =============================================================================
// Commands
// =============================================================================

/// A single set mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetCommand {
    /// Add members to the set at `key` (SADD).
    Add {
        /// Target key.
        key: String,
        /// Members to add.
        members: Vec<String>,
    },
    /// Remove one member from the set at `key` (SREM).
    Remove {
        /// Target key.
        key: String,
        /// Member to remove.
        member: String,
    },
    /// Delete the whole set at `key` (DEL).
    Delete {
        /// Target key.
        key: String,
    },
}

/// Group of mutations applied by one store call.
///
/// Batches are not transactional: a failure part-way through may leave
/// other commands applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetBatch {
    commands: Vec<SetCommand>,
}

impl SetBatch {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an SADD. Empty member lists are skipped.
    pub fn add(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.commands.push(SetCommand::Add {
                key: key.into(),
                members,
            });
        }
        self
    }

    /// Queue an SREM of a single member.
    pub fn remove(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.commands.push(SetCommand::Remove {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    /// Queue a DEL.
    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.commands.push(SetCommand::Delete { key: key.into() });
        self
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Queued commands in order.
    #[must_use]
    pub fn commands(&self) -> &[SetCommand] {
        &self.commands
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Set store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Backend could not be reached.
    #[error("Store connection error: {message}")]
    Connection {
        /// Error details.
        message: String,
    },

    /// Backend rejected or failed a command.
    #[error("Store command failed: {message}")]
    Command {
        /// Error details.
        message: String,
    },

    /// Operation exceeded its deadline.
    #[error("Store operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that was exceeded.
        timeout_ms: u64,
    },
}

// =============================================================================
// Port
// =============================================================================

/// Port for set storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SetStorePort: Send + Sync {
    /// All members of the set at `key`. A missing key is an empty set.
    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Apply a batch of mutations in one round-trip.
    async fn execute(&self, batch: SetBatch) -> Result<(), StoreError>;

    /// Check the backend is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_skips_empty_adds() {
        let mut batch = SetBatch::new();
        batch.add("client:a:fx", Vec::new()).delete("client:a:fx");

        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch.commands()[0],
            SetCommand::Delete {
                key: "client:a:fx".to_string()
            }
        );
    }

    #[test]
    fn batch_preserves_order() {
        let mut batch = SetBatch::new();
        batch
            .remove("symbol:fx:EURUSD", "a")
            .delete("client:a:fx")
            .add("client:a:fx", vec!["GBPUSD".to_string()]);

        assert!(matches!(batch.commands()[0], SetCommand::Remove { .. }));
        assert!(matches!(batch.commands()[1], SetCommand::Delete { .. }));
        assert!(matches!(batch.commands()[2], SetCommand::Add { .. }));
    }

    #[test]
    fn timeout_error_names_deadline() {
        let err = StoreError::Timeout { timeout_ms: 2000 };
        assert_eq!(err.to_string(), "Store operation timed out after 2000ms");
    }
}
