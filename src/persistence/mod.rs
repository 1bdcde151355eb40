//! Persistence layer for experiment records

#[cfg(feature = "sqlite")]
pub mod store;
pub mod transaction;

#[cfg(feature = "sqlite")]
pub use store::SqliteExperimentStore;
pub use transaction::{begin_transaction, end_transaction, Transaction};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persisted bookkeeping of one experiment run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    /// Experiment identity
    pub id: Uuid,

    /// Experiment name
    pub name: String,

    /// Earliest observed begin
    pub begin: Option<DateTime<Utc>>,

    /// Latest observed end
    pub end: Option<DateTime<Utc>>,

    /// Optimistic concurrency counter, bumped by every successful commit
    pub version: i64,
}

impl ExperimentRecord {
    /// Create a fresh record with a random id
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create a fresh record with a known id
    pub fn with_id(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            begin: None,
            end: None,
            version: 0,
        }
    }

    /// Whether both the begin and the end time were recorded
    pub fn is_complete(&self) -> bool {
        self.begin.is_some() && self.end.is_some()
    }
}

/// Error types for persistence operations
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Another writer committed the record first
    #[error("stale data: experiment {id} was modified concurrently")]
    StaleData { id: Uuid },

    /// The session cannot serve the request (e.g. it is closed)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("database error: {0}")]
    Database(String),
}

/// Trait for experiment stores
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Insert the record if its id is unknown, then return the stored
    /// record and a session to modify it
    async fn persist_experiment(
        &self,
        record: &ExperimentRecord,
    ) -> Result<(ExperimentRecord, Box<dyn StoreSession>), PersistenceError>;

    /// Load a record by id
    async fn load_experiment(&self, id: Uuid) -> Result<Option<ExperimentRecord>, PersistenceError>;

    /// List all records, most recently begun first
    async fn list_experiments(&self) -> Result<Vec<ExperimentRecord>, PersistenceError>;
}

/// Unit of work over one experiment record
#[async_trait]
pub trait StoreSession: Send {
    /// Stage a record for the next commit
    fn add(&mut self, record: &ExperimentRecord) -> Result<(), PersistenceError>;

    /// Write the staged record, returning it with its new version
    ///
    /// A failed commit discards the staged record.
    async fn commit(&mut self) -> Result<Option<ExperimentRecord>, PersistenceError>;

    /// Load the record as currently stored, with its current version
    async fn refresh(&mut self, id: Uuid) -> Result<Option<ExperimentRecord>, PersistenceError>;

    /// Close the session; later requests fail with `InvalidRequest`
    fn close(&mut self);

    /// Whether the session has been closed
    fn is_closed(&self) -> bool;
}

/// In-memory store (for testing or ephemeral use)
#[derive(Clone, Default)]
pub struct InMemoryStore {
    records: Arc<RwLock<HashMap<Uuid, ExperimentRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExperimentStore for InMemoryStore {
    async fn persist_experiment(
        &self,
        record: &ExperimentRecord,
    ) -> Result<(ExperimentRecord, Box<dyn StoreSession>), PersistenceError> {
        let stored = {
            let mut records = self.records.write().await;
            records
                .entry(record.id)
                .or_insert_with(|| record.clone())
                .clone()
        };

        let session = InMemorySession {
            records: Arc::clone(&self.records),
            pending: None,
            closed: false,
        };

        Ok((stored, Box::new(session)))
    }

    async fn load_experiment(&self, id: Uuid) -> Result<Option<ExperimentRecord>, PersistenceError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list_experiments(&self) -> Result<Vec<ExperimentRecord>, PersistenceError> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.begin.cmp(&a.begin));
        Ok(records)
    }
}

/// Session over an [`InMemoryStore`]
pub struct InMemorySession {
    records: Arc<RwLock<HashMap<Uuid, ExperimentRecord>>>,
    pending: Option<ExperimentRecord>,
    closed: bool,
}

#[async_trait]
impl StoreSession for InMemorySession {
    fn add(&mut self, record: &ExperimentRecord) -> Result<(), PersistenceError> {
        if self.closed {
            return Err(PersistenceError::InvalidRequest(
                "session is closed".to_string(),
            ));
        }
        self.pending = Some(record.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<Option<ExperimentRecord>, PersistenceError> {
        if self.closed {
            return Err(PersistenceError::InvalidRequest(
                "session is closed".to_string(),
            ));
        }

        let Some(mut pending) = self.pending.take() else {
            return Ok(None);
        };

        let mut records = self.records.write().await;
        let current_version = records.get(&pending.id).map(|r| r.version);
        if current_version.is_some_and(|v| v != pending.version) {
            return Err(PersistenceError::StaleData { id: pending.id });
        }

        pending.version += 1;
        records.insert(pending.id, pending.clone());
        Ok(Some(pending))
    }

    async fn refresh(&mut self, id: Uuid) -> Result<Option<ExperimentRecord>, PersistenceError> {
        if self.closed {
            return Err(PersistenceError::InvalidRequest(
                "session is closed".to_string(),
            ));
        }
        Ok(self.records.read().await.get(&id).cloned())
    }

    fn close(&mut self) {
        self.pending = None;
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
