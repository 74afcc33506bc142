//! Process-wide cache of live backend connections.
//!
//! One slot per distinct [`BackendConfig`]. Each slot is filled at most once
//! (single-flight): concurrent lookups for an equal config wait on the same
//! in-flight build, while lookups for other configs proceed independently.
//! A handle older than the TTL is evicted on the next lookup and released
//! before a replacement is built.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::backend::{Connection, Connector, NativeConnector};
use crate::config::{BackendConfig, BackendKind};
use crate::error::DispatchError;
use crate::ttl::{CONNECTION_DEFAULT_TTL, Clock, SystemClock, expires_at, is_expired};

// ============================================================================
// Connection Handle
// ============================================================================

/// A live backend connection owned by the cache.
pub struct ConnectionHandle {
    id: u64,
    label: String,
    connection: Connection,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl ConnectionHandle {
    /// Unique per build; a rebuilt connection gets a new id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> BackendKind {
        self.connection.kind()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.expires_at, now)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    async fn release(&self) {
        info!("Releasing connection #{} ({})", self.id, self.label);
        self.connection.close().await;
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ============================================================================
// Connection Cache
// ============================================================================

/// A slot stays in the map until its handle has been released, so a lookup
/// that arrives mid-release waits on `released` instead of building a second
/// connection.
#[derive(Default)]
struct Slot {
    handle: OnceCell<Arc<ConnectionHandle>>,
    /// Set once the handle is expired or invalidated.
    retired: AtomicBool,
    released: OnceCell<()>,
}

impl Slot {
    async fn release(&self) {
        self.retired.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.get() {
            self.released.get_or_init(|| handle.release()).await;
        }
    }
}

pub struct ConnectionCache {
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    slots: Mutex<HashMap<BackendConfig, Arc<Slot>>>,
    next_id: AtomicU64,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn Connector>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            connector,
            clock,
            ttl,
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Real backends, wall clock, the given TTL.
    pub fn native(ttl: Duration) -> Self {
        Self::new(
            Arc::new(NativeConnector::default()),
            Arc::new(SystemClock),
            ttl,
        )
    }

    /// Return the live connection for `config`, building it if needed.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::ConfigIncomplete`] before any lookup if a required
    ///   field is empty.
    /// - [`DispatchError::Connection`] if the backend cannot be reached. Nothing
    ///   is cached; the next lookup tries again.
    pub async fn get_or_create(
        &self,
        config: &BackendConfig,
    ) -> Result<Arc<ConnectionHandle>, DispatchError> {
        config.validate()?;

        loop {
            let slot = self.slot_for(config);
            let handle = slot
                .handle
                .get_or_try_init(|| self.build(config))
                .await?
                .clone();

            if !slot.retired.load(Ordering::SeqCst) && !handle.is_expired(self.clock.now()) {
                return Ok(handle);
            }

            debug!(
                "Connection #{} ({}) retired, expiry {}",
                handle.id, handle.label, handle.expires_at
            );
            slot.release().await;
            self.evict_if_current(config, &slot);
        }
    }

    /// Drop and release the connection for `config`, if any.
    pub async fn invalidate(&self, config: &BackendConfig) {
        let slot = self.slots.lock().get(config).cloned();
        if let Some(slot) = slot {
            slot.release().await;
            self.evict_if_current(config, &slot);
        }
    }

    /// Release every cached connection.
    pub async fn shutdown(&self) {
        let slots: Vec<(BackendConfig, Arc<Slot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(config, slot)| (config.clone(), slot.clone()))
            .collect();
        for (config, slot) in slots {
            slot.release().await;
            self.evict_if_current(&config, &slot);
        }
    }

    /// Number of configs with a built connection.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| s.handle.initialized() && !s.retired.load(Ordering::SeqCst))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_for(&self, config: &BackendConfig) -> Arc<Slot> {
        self.slots
            .lock()
            .entry(config.clone())
            .or_default()
            .clone()
    }

    fn evict_if_current(&self, config: &BackendConfig, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock();
        if slots.get(config).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(config);
        }
    }

    async fn build(&self, config: &BackendConfig) -> Result<Arc<ConnectionHandle>, DispatchError> {
        let connection = self
            .connector
            .connect(config)
            .await
            .map_err(|e| DispatchError::Connection(e.to_string()))?;

        let created_at = self.clock.now();
        let handle = ConnectionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            label: config.label(),
            connection,
            created_at,
            expires_at: expires_at(created_at, self.ttl),
        };
        info!(
            "Built connection #{} ({}), expires {}",
            handle.id, handle.label, handle.expires_at
        );
        Ok(Arc::new(handle))
    }
}

impl Default for ConnectionCache {
    fn default() -> Self {
        Self::native(CONNECTION_DEFAULT_TTL)
    }
}

// ============================================================================
// Tests
// ============================================================================
