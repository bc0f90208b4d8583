//! Connection cache: one physical connection per (user mapping, access mode).
//!
//! The cache is an explicit service object rather than a global: construct
//! one per session with [`ConnectionCache::new`] and hand it (or an `Arc` of
//! it) to whatever needs remote connections.
//!
//! # Architecture
//!
//! ```text
//! Remote Executor calls acquire(mapping, read)
//!   → first call ever: subscribe InvalidationCoordinator with the host (once)
//!   → entry for ConnKey { mapping, read } (created empty on first use)
//!     → live connection mid state change  → discard, ConnectionLost
//!     → invalidated and xact_depth == 0   → disconnect, rebuild below
//!     → live connection                   → return it (no health check)
//!     → no connection → resolve server + user options
//!                     → ConnectionFactory::connect(details)
//!                     → record fingerprints, reset bookkeeping → return it
//! ```
//!
//! The entry table is shared with the [`InvalidationCoordinator`], whose
//! callbacks may run at any point between two cache calls. The table lock is
//! never held across host lookups or network connects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use chfdw_core::{CatalogCacheId, ConnKey, ConnectionDetails, Fingerprint, MappingId};

use crate::coordinator::InvalidationCoordinator;
use crate::error::{ConnError, ConnResult};
use crate::gate::{ConnectionFactory, ConnectionHandle};
use crate::host::HostEnvironment;

// ── Shared state ─────────────────────────────────────────────────────

/// A cache slot: at most one connection plus its transaction bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct ConnEntry {
    pub(crate) handle: Option<ConnectionHandle>,
    /// Remote transaction nesting depth; 0 means none open.
    pub(crate) xact_depth: u32,
    pub(crate) have_error: bool,
    /// Set while a remote begin/commit/rollback is in flight.
    pub(crate) changing_xact_state: bool,
    pub(crate) invalidated: bool,
    /// Only meaningful while `handle` is `Some`.
    pub(crate) server_fingerprint: Fingerprint,
    pub(crate) mapping_fingerprint: Fingerprint,
}

impl ConnEntry {
    pub(crate) fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Detach the connection and return the entry to its initial state.
    /// The caller disconnects the returned handle outside the table lock.
    fn take_connection(&mut self) -> Option<ConnectionHandle> {
        std::mem::take(self).handle
    }
}

#[derive(Debug, Default)]
pub(crate) struct CacheState {
    pub(crate) entries: HashMap<ConnKey, ConnEntry>,
    /// A connection was acquired during the current host transaction.
    pub(crate) xact_got_connection: bool,
    pub(crate) cursor_number: u32,
}

pub(crate) type SharedState = Arc<Mutex<CacheState>>;

pub(crate) fn lock_state(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Public snapshots ─────────────────────────────────────────────────

/// Bookkeeping of one cache entry, as returned by
/// [`ConnectionCache::entry_state`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryState {
    /// Id of the live connection, if any.
    pub connection_id: Option<u64>,
    pub xact_depth: u32,
    pub have_error: bool,
    pub changing_xact_state: bool,
    pub invalidated: bool,
    pub server_fingerprint: Fingerprint,
    pub mapping_fingerprint: Fingerprint,
}

impl EntryState {
    pub fn is_connected(&self) -> bool {
        self.connection_id.is_some()
    }
}

/// Aggregate counters over the whole cache.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub connections: usize,
    pub invalidated: usize,
    /// Entries with an open remote transaction (`xact_depth > 0`).
    pub in_transaction: usize,
}

// ── ConnectionCache ──────────────────────────────────────────────────

/// Session-scoped cache of remote connections.
pub struct ConnectionCache {
    host: Arc<dyn HostEnvironment>,
    factory: Arc<dyn ConnectionFactory>,
    state: SharedState,
    /// Set on the first `acquire`; holds the subscribed coordinator.
    coordinator: OnceLock<Arc<InvalidationCoordinator>>,
    next_connection_id: AtomicU64,
    prep_stmt_number: AtomicU32,
}

impl ConnectionCache {
    pub fn new(host: Arc<dyn HostEnvironment>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            host,
            factory,
            state: Arc::new(Mutex::new(CacheState::default())),
            coordinator: OnceLock::new(),
            next_connection_id: AtomicU64::new(1),
            prep_stmt_number: AtomicU32::new(0),
        }
    }

    /// Whether the coordinator has been registered with the host.
    pub fn is_initialized(&self) -> bool {
        self.coordinator.get().is_some()
    }

    fn ensure_initialized(&self) {
        self.coordinator.get_or_init(|| {
            let coordinator = Arc::new(InvalidationCoordinator::new(Arc::clone(&self.state)));
            self.host.subscribe(coordinator.clone());
            tracing::debug!("registered connection cache with host events");
            coordinator
        });
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        lock_state(&self.state)
    }

    /// Get a connection for `mapping`, building one if needed.
    ///
    /// `read` selects the access mode: read and read-write connections for
    /// the same mapping are separate slots. Repeated calls return the same
    /// physical connection until it is invalidated and torn down.
    ///
    /// Fails with [`ConnError::ConnectionLost`] when the cached connection
    /// was left in the middle of a transaction state change; the connection
    /// is discarded and the next call builds a new one.
    pub fn acquire(&self, mapping: MappingId, read: bool) -> ConnResult<ConnectionHandle> {
        self.ensure_initialized();
        let key = ConnKey::new(mapping, read);

        let stale = {
            let mut state = self.lock();
            state.xact_got_connection = true;
            let entry = state.entries.entry(key).or_default();

            if entry.is_connected() && entry.changing_xact_state {
                let lost = entry.take_connection();
                drop(state);
                if let Some(handle) = lost {
                    handle.disconnect();
                    tracing::warn!(
                        mapping = %key.mapping,
                        read = key.read,
                        connection_id = handle.id(),
                        "discarded connection left in the middle of a transaction state change"
                    );
                }
                return Err(ConnError::ConnectionLost {
                    server: self.server_name(mapping),
                });
            }

            let mut stale = None;
            if entry.invalidated && entry.xact_depth == 0 {
                stale = entry.take_connection();
            }
            if let Some(handle) = &entry.handle {
                tracing::debug!(
                    mapping = %key.mapping,
                    read = key.read,
                    connection_id = handle.id(),
                    "reusing cached connection"
                );
                return Ok(handle.clone());
            }
            stale
        };

        if let Some(handle) = stale {
            handle.disconnect();
            tracing::info!(
                mapping = %key.mapping,
                read = key.read,
                connection_id = handle.id(),
                "closed connection after catalog invalidation"
            );
        }

        self.connect(key)
    }

    /// Resolve options and open a fresh connection for `key`.
    fn connect(&self, key: ConnKey) -> ConnResult<ConnectionHandle> {
        let mapping = self
            .host
            .user_mapping(key.mapping)
            .ok_or(ConnError::MappingNotFound(key.mapping))?;
        let server = self
            .host
            .foreign_server(mapping.server)
            .ok_or(ConnError::ServerNotFound(mapping.server))?;
        let details = ConnectionDetails::resolve(&server.options, &mapping.options)?;

        let conn = self.factory.connect(&details)?;
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle::new(id, conn);

        let server_fingerprint = self
            .host
            .fingerprint(CatalogCacheId::ForeignServer, server.id.0);
        let mapping_fingerprint = self
            .host
            .fingerprint(CatalogCacheId::UserMapping, mapping.id.0);

        let mut state = self.lock();
        let entry = state.entries.entry(key).or_default();
        if let Some(existing) = &entry.handle {
            // Another caller filled the slot while we were connecting.
            let existing = existing.clone();
            drop(state);
            handle.disconnect();
            return Ok(existing);
        }
        *entry = ConnEntry {
            handle: Some(handle.clone()),
            server_fingerprint,
            mapping_fingerprint,
            ..ConnEntry::default()
        };
        drop(state);

        tracing::debug!(
            mapping = %key.mapping,
            read = key.read,
            server = %server.name,
            connection_id = id,
            driver = %details.driver,
            host = %details.host,
            port = details.port,
            "new connection"
        );
        Ok(handle)
    }

    /// Name of the mapping's server for diagnostics.
    fn server_name(&self, mapping: MappingId) -> String {
        self.host
            .user_mapping(mapping)
            .and_then(|m| self.host.foreign_server(m.server))
            .map(|s| s.name)
            .unwrap_or_else(|| format!("<user mapping {mapping}>"))
    }

    // ── Remote transaction bookkeeping ───────────────────────────────

    /// Record that remote transaction state is open on `key`'s connection
    /// up to the host nesting level `nest_level`.
    pub fn note_remote_xact(&self, key: ConnKey, nest_level: u32) -> ConnResult<()> {
        let mut state = self.lock();
        let entry = state
            .entries
            .get_mut(&key)
            .filter(|e| e.is_connected())
            .ok_or(ConnError::Closed)?;
        if nest_level > entry.xact_depth {
            entry.xact_depth = nest_level;
            tracing::debug!(
                mapping = %key.mapping,
                read = key.read,
                xact_depth = nest_level,
                "remote transaction depth raised"
            );
        }
        Ok(())
    }

    /// Record that the current remote transaction on `key` saw an error.
    pub fn record_remote_error(&self, key: ConnKey) {
        if let Some(entry) = self.lock().entries.get_mut(&key) {
            entry.have_error = true;
        }
    }

    /// Mark the start of a remote begin/commit/rollback on `key`.
    ///
    /// The flag stays set until [`XactStateChange::complete`] is called. If
    /// the guard is dropped without completing, the next `acquire` for `key`
    /// discards the connection. Fails with [`ConnError::Closed`] when `key`
    /// has no live connection.
    pub fn start_xact_state_change(&self, key: ConnKey) -> ConnResult<XactStateChange> {
        let mut state = self.lock();
        let entry = state.entries.get_mut(&key).ok_or(ConnError::Closed)?;
        let connection_id = entry
            .handle
            .as_ref()
            .map(ConnectionHandle::id)
            .ok_or(ConnError::Closed)?;
        entry.changing_xact_state = true;
        Ok(XactStateChange {
            state: Arc::clone(&self.state),
            key,
            connection_id,
            completed: false,
        })
    }

    /// Next remote cursor number. Restarts after every top-level
    /// transaction.
    pub fn next_cursor_number(&self) -> u32 {
        let mut state = self.lock();
        state.cursor_number += 1;
        state.cursor_number
    }

    /// Next prepared statement number. Never restarts.
    pub fn next_prep_stmt_number(&self) -> u32 {
        self.prep_stmt_number.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn entry_state(&self, key: ConnKey) -> Option<EntryState> {
        let state = self.lock();
        let entry = state.entries.get(&key)?;
        Some(EntryState {
            connection_id: entry.handle.as_ref().map(ConnectionHandle::id),
            xact_depth: entry.xact_depth,
            have_error: entry.have_error,
            changing_xact_state: entry.changing_xact_state,
            invalidated: entry.invalidated,
            server_fingerprint: entry.server_fingerprint,
            mapping_fingerprint: entry.mapping_fingerprint,
        })
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let mut stats = CacheStats {
            entries: state.entries.len(),
            ..CacheStats::default()
        };
        for entry in state.entries.values().filter(|e| e.is_connected()) {
            stats.connections += 1;
            if entry.invalidated {
                stats.invalidated += 1;
            }
            if entry.xact_depth > 0 {
                stats.in_transaction += 1;
            }
        }
        stats
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            entries = stats.entries,
            connections = stats.connections,
            invalidated = stats.invalidated,
            in_transaction = stats.in_transaction,
            "connection cache stats"
        );
    }

    /// Disconnect every cached connection. Returns how many were closed.
    pub fn shutdown(&self) -> usize {
        let handles: Vec<ConnectionHandle> = {
            let mut state = self.lock();
            state
                .entries
                .drain()
                .filter_map(|(_, mut entry)| entry.take_connection())
                .collect()
        };
        for handle in &handles {
            handle.disconnect();
        }
        if !handles.is_empty() {
            tracing::info!(closed = handles.len(), "connection cache shut down");
        }
        handles.len()
    }
}

impl Drop for ConnectionCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("initialized", &self.is_initialized())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// ── XactStateChange ──────────────────────────────────────────────────

/// Guard for a remote transaction state change; see
/// [`ConnectionCache::start_xact_state_change`].
#[must_use = "dropping the guard without complete() leaves the connection unusable"]
#[derive(Debug)]
pub struct XactStateChange {
    state: SharedState,
    key: ConnKey,
    connection_id: u64,
    completed: bool,
}

impl XactStateChange {
    /// The state change finished; the connection may be handed out again.
    ///
    /// Has no effect if the entry has since been rebuilt on a different
    /// connection.
    pub fn complete(mut self) {
        if let Some(entry) = lock_state(&self.state).entries.get_mut(&self.key) {
            if entry.handle.as_ref().map(ConnectionHandle::id) == Some(self.connection_id) {
                entry.changing_xact_state = false;
            }
        }
        self.completed = true;
    }
}

impl Drop for XactStateChange {
    fn drop(&mut self) {
        if !self.completed {
            tracing::debug!(
                mapping = %self.key.mapping,
                read = self.key.read,
                connection_id = self.connection_id,
                "transaction state change interrupted"
            );
        }
    }
}
