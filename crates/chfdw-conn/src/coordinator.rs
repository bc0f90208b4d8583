//! Transaction and invalidation coordinator.
//!
//! Subscribed to the host once, on the cache's first `acquire`. Catalog
//! changes only mark entries; teardown happens in `acquire` once the entry's
//! remote transaction depth is back to 0. Transaction boundaries maintain
//! the depth counters and per-transaction counters but never talk to the
//! remote server and never clear `changing_xact_state`.

use chfdw_core::{CatalogCacheId, Fingerprint, RESET_FINGERPRINT};

use crate::cache::{SharedState, lock_state};
use crate::host::{HostEventSubscriber, SubXactEvent, XactEvent};

pub struct InvalidationCoordinator {
    state: SharedState,
}

impl InvalidationCoordinator {
    pub(crate) fn new(state: SharedState) -> Self {
        Self { state }
    }
}

impl std::fmt::Debug for InvalidationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationCoordinator").finish_non_exhaustive()
    }
}

impl HostEventSubscriber for InvalidationCoordinator {
    fn on_xact_event(&self, event: XactEvent) {
        if event == XactEvent::Begin {
            return;
        }
        let mut state = lock_state(&self.state);
        if !state.xact_got_connection {
            return;
        }

        let mut closed_xacts = 0usize;
        for entry in state.entries.values_mut().filter(|e| e.is_connected()) {
            if entry.xact_depth > 0 {
                entry.xact_depth = 0;
                entry.have_error = false;
                closed_xacts += 1;
            }
        }
        state.xact_got_connection = false;
        state.cursor_number = 0;

        tracing::debug!(event = %event, closed_xacts, "transaction end bookkeeping");
    }

    fn on_subxact_event(&self, event: SubXactEvent, nest_level: u32) {
        if event == SubXactEvent::Begin {
            return;
        }
        let mut state = lock_state(&self.state);
        if !state.xact_got_connection {
            return;
        }

        let parent = nest_level.saturating_sub(1);
        for (key, entry) in state.entries.iter_mut() {
            if entry.is_connected() && entry.xact_depth > parent {
                entry.xact_depth = parent;
                tracing::debug!(
                    mapping = %key.mapping,
                    read = key.read,
                    event = %event,
                    xact_depth = parent,
                    "subtransaction end bookkeeping"
                );
            }
        }
    }

    fn on_catalog_invalidation(&self, cache: CatalogCacheId, fingerprint: Fingerprint) {
        let mut state = lock_state(&self.state);
        for (key, entry) in state.entries.iter_mut() {
            // Fingerprints of an empty entry are not meaningful.
            if !entry.is_connected() {
                continue;
            }
            let matches = fingerprint == RESET_FINGERPRINT
                || match cache {
                    CatalogCacheId::ForeignServer => entry.server_fingerprint == fingerprint,
                    CatalogCacheId::UserMapping => entry.mapping_fingerprint == fingerprint,
                };
            if matches && !entry.invalidated {
                entry.invalidated = true;
                tracing::debug!(
                    mapping = %key.mapping,
                    read = key.read,
                    cache = %cache,
                    fingerprint,
                    xact_depth = entry.xact_depth,
                    "connection marked invalid"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chfdw_core::{ConnKey, DriverKind, MappingId};

    use crate::cache::{CacheState, ConnEntry};
    use crate::error::ConnResult;
    use crate::gate::{ConnectionHandle, Cursor, RemoteConnection};

    #[derive(Debug)]
    struct Idle;

    impl RemoteConnection for Idle {
        fn driver(&self) -> DriverKind {
            DriverKind::Http
        }
        fn execute(&mut self, _sql: &str) -> ConnResult<Cursor> {
            Ok(Cursor::empty())
        }
        fn cancel(&mut self) -> ConnResult<bool> {
            Ok(false)
        }
        fn disconnect(&mut self) {}
    }

    fn live_entry(server_fp: Fingerprint, mapping_fp: Fingerprint, depth: u32) -> ConnEntry {
        ConnEntry {
            handle: Some(ConnectionHandle::new(1, Box::new(Idle))),
            xact_depth: depth,
            server_fingerprint: server_fp,
            mapping_fingerprint: mapping_fp,
            ..ConnEntry::default()
        }
    }

    fn key(n: u32) -> ConnKey {
        ConnKey::new(MappingId(n), true)
    }

    fn make_coordinator(entries: Vec<(ConnKey, ConnEntry)>) -> (InvalidationCoordinator, SharedState) {
        let state = Arc::new(Mutex::new(CacheState {
            entries: entries.into_iter().collect(),
            xact_got_connection: true,
            cursor_number: 5,
        }));
        (InvalidationCoordinator::new(Arc::clone(&state)), state)
    }

    fn invalidated(state: &SharedState, k: ConnKey) -> bool {
        lock_state(state).entries[&k].invalidated
    }

    // ── Catalog invalidation ─────────────────────────────────────────

    #[test]
    fn server_fingerprint_selects_entries() {
        let (coord, state) = make_coordinator(vec![
            (key(1), live_entry(10, 20, 0)),
            (key(2), live_entry(11, 20, 0)),
        ]);
        coord.on_catalog_invalidation(CatalogCacheId::ForeignServer, 10);
        assert!(invalidated(&state, key(1)));
        assert!(!invalidated(&state, key(2)));
    }

    #[test]
    fn mapping_fingerprint_is_not_compared_to_server_events() {
        let (coord, state) = make_coordinator(vec![(key(1), live_entry(10, 20, 0))]);
        coord.on_catalog_invalidation(CatalogCacheId::ForeignServer, 20);
        assert!(!invalidated(&state, key(1)));
        coord.on_catalog_invalidation(CatalogCacheId::UserMapping, 20);
        assert!(invalidated(&state, key(1)));
    }

    #[test]
    fn reset_marks_all_live_entries_and_skips_empty_ones() {
        let (coord, state) = make_coordinator(vec![
            (key(1), live_entry(10, 20, 0)),
            (key(2), live_entry(11, 21, 3)),
            (key(3), ConnEntry::default()),
        ]);
        coord.on_catalog_invalidation(CatalogCacheId::UserMapping, RESET_FINGERPRINT);
        assert!(invalidated(&state, key(1)));
        assert!(invalidated(&state, key(2)));
        assert!(!invalidated(&state, key(3)));
        // Marking never closes.
        assert!(lock_state(&state).entries[&key(2)].is_connected());
    }

    // ── Transaction boundaries ───────────────────────────────────────

    #[test]
    fn top_level_end_resets_depth_and_counters() {
        let mut erroring = live_entry(10, 20, 2);
        erroring.have_error = true;
        erroring.changing_xact_state = true;
        let (coord, state) = make_coordinator(vec![(key(1), erroring)]);

        coord.on_xact_event(XactEvent::Abort);
        let s = lock_state(&state);
        let entry = &s.entries[&key(1)];
        assert_eq!(entry.xact_depth, 0);
        assert!(!entry.have_error);
        assert!(entry.changing_xact_state);
        assert!(!s.xact_got_connection);
        assert_eq!(s.cursor_number, 0);
    }

    #[test]
    fn top_level_end_without_connection_use_is_noop() {
        let (coord, state) = make_coordinator(vec![(key(1), live_entry(10, 20, 1))]);
        lock_state(&state).xact_got_connection = false;
        coord.on_xact_event(XactEvent::Commit);
        let s = lock_state(&state);
        assert_eq!(s.entries[&key(1)].xact_depth, 1);
        assert_eq!(s.cursor_number, 5);
    }

    #[test]
    fn begin_events_change_nothing() {
        let (coord, state) = make_coordinator(vec![(key(1), live_entry(10, 20, 3))]);
        coord.on_xact_event(XactEvent::Begin);
        coord.on_subxact_event(SubXactEvent::Begin, 4);
        let s = lock_state(&state);
        assert_eq!(s.entries[&key(1)].xact_depth, 3);
        assert!(s.xact_got_connection);
    }

    #[test]
    fn subxact_end_lowers_only_deeper_entries() {
        let (coord, state) = make_coordinator(vec![
            (key(1), live_entry(10, 20, 3)),
            (key(2), live_entry(10, 21, 1)),
        ]);
        coord.on_subxact_event(SubXactEvent::Commit, 3);
        {
            let s = lock_state(&state);
            assert_eq!(s.entries[&key(1)].xact_depth, 2);
            assert_eq!(s.entries[&key(2)].xact_depth, 1);
        }
        coord.on_subxact_event(SubXactEvent::Abort, 2);
        let s = lock_state(&state);
        assert_eq!(s.entries[&key(1)].xact_depth, 1);
        assert_eq!(s.entries[&key(2)].xact_depth, 1);
    }
}
