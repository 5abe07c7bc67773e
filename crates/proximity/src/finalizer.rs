// Connection finalizer - turns a verified session into exactly one Connection

use crate::{ProximityError, Result, VerificationResult};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use shared::{Connection, Identity};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Storage collaborator that persists connections
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Persist the verified relationship; failures are reported as `PersistenceError`
    async fn save_connection(&self, result: &VerificationResult, local: &Identity) -> Result<Connection>;
}

/// Idempotent front of a `ConnectionStore`
///
/// The first caller per session runs the save; concurrent callers wait on the
/// same cell and receive the same `Connection`. A failed save leaves the cell
/// empty so the next call retries.
pub struct ConnectionFinalizer {
    store: Arc<dyn ConnectionStore>,
    finalized: DashMap<Uuid, Arc<OnceCell<Connection>>>,
}

impl ConnectionFinalizer {
    pub fn new(store: Arc<dyn ConnectionStore>) -> Self {
        Self {
            store,
            finalized: DashMap::new(),
        }
    }

    pub async fn persist(&self, result: &VerificationResult, local: &Identity) -> Result<Connection> {
        let cell = self
            .finalized
            .entry(result.session_id)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        if let Some(existing) = cell.get() {
            debug!(session_id = %result.session_id, "Session already finalized");
            return Ok(existing.clone());
        }

        let connection = cell
            .get_or_try_init(|| async {
                info!(
                    session_id = %result.session_id,
                    method = %result.method,
                    peer_user = %result.peer_identity.user_id,
                    "Persisting connection"
                );
                self.store.save_connection(result, local).await.map_err(|e| match e {
                    ProximityError::PersistenceError(_) => e,
                    other => ProximityError::PersistenceError(other.to_string()),
                })
            })
            .await
            .map_err(|e| {
                warn!(session_id = %result.session_id, error = %e, "Failed to persist connection");
                e
            })?;

        Ok(connection.clone())
    }

    pub fn is_finalized(&self, session_id: &Uuid) -> bool {
        self.finalized
            .get(session_id)
            .map(|cell| cell.initialized())
            .unwrap_or(false)
    }

    pub fn finalized_count(&self) -> usize {
        self.finalized.iter().filter(|entry| entry.value().initialized()).count()
    }
}

/// Process-local store, for hosts without a backend and for tests
#[derive(Default)]
pub struct InMemoryConnectionStore {
    connections: RwLock<Vec<Connection>>,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connections(&self) -> Vec<Connection> {
        self.connections.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn save_connection(&self, result: &VerificationResult, local: &Identity) -> Result<Connection> {
        let connection = Connection {
            id: Uuid::new_v4(),
            session_id: result.session_id,
            local_user_id: local.user_id.clone(),
            peer: result.peer_identity.clone(),
            method: result.method,
            distance_meters: result.distance_meters,
            verified_at: result.verified_at,
            created_at: Utc::now(),
        };

        self.connections.write().await.push(connection.clone());
        Ok(connection)
    }
}
