//! Host environment interface.
//!
//! The connection cache never reaches into the host engine directly. It sees
//! the host through [`HostEnvironment`] (catalog lookups plus a one-time
//! subscription) and receives transaction and catalog-change notifications
//! as plain synchronous calls on [`HostEventSubscriber`].
//!
//! [`LocalHost`] is an in-process implementation backed by a [`Catalog`],
//! used by the CLI and by tests to drive transactions and catalog changes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chfdw_core::{
    Catalog, CatalogCacheId, Fingerprint, ForeignServer, MappingId, OptionSet, RESET_FINGERPRINT,
    ServerId, UserMapping,
};

/// Top-level transaction boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XactEvent {
    Begin,
    Commit,
    Abort,
}

/// Subtransaction boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubXactEvent {
    Begin,
    Commit,
    Abort,
}

impl std::fmt::Display for XactEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            XactEvent::Begin => write!(f, "begin"),
            XactEvent::Commit => write!(f, "commit"),
            XactEvent::Abort => write!(f, "abort"),
        }
    }
}

impl std::fmt::Display for SubXactEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubXactEvent::Begin => write!(f, "begin_sub"),
            SubXactEvent::Commit => write!(f, "commit_sub"),
            SubXactEvent::Abort => write!(f, "abort_sub"),
        }
    }
}

/// Receiver of host notifications. Every call is delivered synchronously at
/// the boundary it describes.
pub trait HostEventSubscriber: Send + Sync {
    fn on_xact_event(&self, event: XactEvent);

    /// `nest_level` is the level of the subtransaction the event belongs to
    /// (the top-level transaction is level 1).
    fn on_subxact_event(&self, event: SubXactEvent, nest_level: u32);

    /// A catalog object changed. `fingerprint == 0` means every object in
    /// every catalog may have changed.
    fn on_catalog_invalidation(&self, cache: CatalogCacheId, fingerprint: Fingerprint);
}

/// What the connection cache needs from the host engine.
pub trait HostEnvironment: Send + Sync {
    /// Register for transaction and catalog notifications.
    fn subscribe(&self, subscriber: Arc<dyn HostEventSubscriber>);

    fn user_mapping(&self, id: MappingId) -> Option<UserMapping>;

    fn foreign_server(&self, id: ServerId) -> Option<ForeignServer>;

    /// Current metadata fingerprint of a catalog object.
    fn fingerprint(&self, cache: CatalogCacheId, id: u32) -> Fingerprint;
}

// ── LocalHost ────────────────────────────────────────────────────────

/// In-process host: a catalog, a transaction nesting counter and a list of
/// subscribers.
pub struct LocalHost {
    catalog: RwLock<Catalog>,
    subscribers: Mutex<Vec<Arc<dyn HostEventSubscriber>>>,
    nest_level: Mutex<u32>,
    subscriptions: AtomicUsize,
}

impl LocalHost {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            subscribers: Mutex::new(Vec::new()),
            nest_level: Mutex::new(0),
            subscriptions: AtomicUsize::new(0),
        }
    }

    /// Read access to the catalog. Do not hold across calls that may
    /// deliver events.
    pub fn catalog(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn catalog_mut(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.catalog.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of times `subscribe` has been called.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Current transaction nesting level; 0 outside any transaction.
    pub fn nest_level(&self) -> u32 {
        *self.nest_level.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn in_transaction(&self) -> bool {
        self.nest_level() > 0
    }

    // Subscribers are snapshotted so a callback may re-enter the host.
    fn subscribers(&self) -> Vec<Arc<dyn HostEventSubscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_nest_level(&self, level: u32) {
        *self.nest_level.lock().unwrap_or_else(PoisonError::into_inner) = level;
    }

    fn deliver_xact(&self, event: XactEvent) {
        tracing::trace!(event = %event, "delivering transaction event");
        for subscriber in self.subscribers() {
            subscriber.on_xact_event(event);
        }
    }

    fn deliver_subxact(&self, event: SubXactEvent, nest_level: u32) {
        tracing::trace!(event = %event, nest_level, "delivering subtransaction event");
        for subscriber in self.subscribers() {
            subscriber.on_subxact_event(event, nest_level);
        }
    }

    fn deliver_invalidation(&self, cache: CatalogCacheId, fingerprint: Fingerprint) {
        tracing::debug!(cache = %cache, fingerprint, "delivering catalog invalidation");
        for subscriber in self.subscribers() {
            subscriber.on_catalog_invalidation(cache, fingerprint);
        }
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// Start a top-level transaction. No-op if one is already open.
    pub fn begin(&self) {
        if self.in_transaction() {
            tracing::warn!("begin called inside a transaction, ignored");
            return;
        }
        self.set_nest_level(1);
        self.deliver_xact(XactEvent::Begin);
    }

    pub fn commit(&self) {
        self.end_xact(XactEvent::Commit);
    }

    pub fn abort(&self) {
        self.end_xact(XactEvent::Abort);
    }

    fn end_xact(&self, event: XactEvent) {
        if !self.in_transaction() {
            tracing::warn!(event = %event, "no transaction in progress, ignored");
            return;
        }
        self.deliver_xact(event);
        self.set_nest_level(0);
    }

    /// Open a subtransaction and return its nesting level.
    pub fn begin_subxact(&self) -> u32 {
        let level = self.nest_level().max(1) + 1;
        if !self.in_transaction() {
            self.begin();
        }
        self.set_nest_level(level);
        self.deliver_subxact(SubXactEvent::Begin, level);
        level
    }

    pub fn commit_subxact(&self) {
        self.end_subxact(SubXactEvent::Commit);
    }

    pub fn abort_subxact(&self) {
        self.end_subxact(SubXactEvent::Abort);
    }

    fn end_subxact(&self, event: SubXactEvent) {
        let level = self.nest_level();
        if level < 2 {
            tracing::warn!(event = %event, "no subtransaction in progress, ignored");
            return;
        }
        self.deliver_subxact(event, level);
        self.set_nest_level(level - 1);
    }

    // ── Catalog changes ──────────────────────────────────────────────

    /// Replace a server's options and broadcast the change.
    pub fn alter_server_options(&self, id: ServerId, options: OptionSet) -> Option<Fingerprint> {
        let fingerprint = self.catalog_mut().alter_server_options(id, options)?;
        self.deliver_invalidation(CatalogCacheId::ForeignServer, fingerprint);
        Some(fingerprint)
    }

    /// Replace a user mapping's options and broadcast the change.
    pub fn alter_user_mapping_options(
        &self,
        id: MappingId,
        options: OptionSet,
    ) -> Option<Fingerprint> {
        let fingerprint = self.catalog_mut().alter_user_mapping_options(id, options)?;
        self.deliver_invalidation(CatalogCacheId::UserMapping, fingerprint);
        Some(fingerprint)
    }

    /// Broadcast a reset of both catalogs.
    pub fn reset_caches(&self) {
        self.deliver_invalidation(CatalogCacheId::ForeignServer, RESET_FINGERPRINT);
        self.deliver_invalidation(CatalogCacheId::UserMapping, RESET_FINGERPRINT);
    }
}

impl std::fmt::Debug for LocalHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHost")
            .field("nest_level", &self.nest_level())
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}

impl HostEnvironment for LocalHost {
    fn subscribe(&self, subscriber: Arc<dyn HostEventSubscriber>) {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    fn user_mapping(&self, id: MappingId) -> Option<UserMapping> {
        self.catalog().user_mapping(id).cloned()
    }

    fn foreign_server(&self, id: ServerId) -> Option<ForeignServer> {
        self.catalog().server(id).cloned()
    }

    fn fingerprint(&self, cache: CatalogCacheId, id: u32) -> Fingerprint {
        self.catalog().fingerprint(cache, id)
    }
}
