//! Protocol gate: one uniform handle over the remote engine's wire drivers.
//!
//! Every physical connection, whatever its driver, exposes the same three
//! operations: execute a statement and iterate the result, cancel an
//! interrupted query, and disconnect.
//!
//! # Architecture
//!
//! ```text
//! ConnectionCache::acquire()
//!   → ConnectionFactory::connect(details)
//!     → details.driver == http   → HttpConnection   (credentials in the URI)
//!     → details.driver == binary → BinaryConnection (credentials in the handshake)
//!   → wrapped in a ConnectionHandle shared with the Remote Executor
//! ```

pub mod binary;
pub mod http;
pub mod tcp;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chfdw_core::config::ConnectionSettings;
use chfdw_core::{ConnectionDetails, DriverKind};

use crate::error::ConnResult;

/// Name and remote type of a result column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// One result row in text form; `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

/// Result of [`RemoteConnection::execute`]: column descriptions plus an
/// iterator over the rows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cursor {
    columns: Vec<Column>,
    rows: VecDeque<Row>,
}

impl Cursor {
    pub fn new(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into(),
        }
    }

    /// Cursor of a statement that produced no result set.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Rows not yet consumed.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

impl Iterator for Cursor {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }
}

/// A physical connection to the remote engine.
pub trait RemoteConnection: Send + fmt::Debug {
    /// Driver that produced this connection.
    fn driver(&self) -> DriverKind;

    /// Send a statement and return its result.
    fn execute(&mut self, sql: &str) -> ConnResult<Cursor>;

    /// Cancel a query left running by an interrupted `execute`.
    ///
    /// Returns `false` when nothing was in flight.
    fn cancel(&mut self) -> ConnResult<bool>;

    /// Close the connection. Idempotent; later calls to `execute` fail.
    fn disconnect(&mut self);
}

/// Establishes physical connections. Injected into the cache for testability.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, details: &ConnectionDetails) -> ConnResult<Box<dyn RemoteConnection>>;
}

/// Driver tunables shared by every connection a factory opens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverSettings {
    pub connect_timeout: Duration,
    pub recv_timeout: Duration,
    pub client_name: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from(&ConnectionSettings::default())
    }
}

impl From<&ConnectionSettings> for DriverSettings {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            recv_timeout: settings.recv_timeout(),
            client_name: settings.client_name.clone(),
        }
    }
}

/// Factory dispatching on [`ConnectionDetails::driver`].
#[derive(Clone, Debug, Default)]
pub struct DriverFactory {
    settings: DriverSettings,
}

impl DriverFactory {
    pub fn new(settings: DriverSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }
}

impl ConnectionFactory for DriverFactory {
    fn connect(&self, details: &ConnectionDetails) -> ConnResult<Box<dyn RemoteConnection>> {
        match details.driver {
            DriverKind::Http => Ok(Box::new(http::HttpConnection::connect(
                details,
                &self.settings,
            )?)),
            DriverKind::Binary => Ok(Box::new(binary::BinaryConnection::connect(
                details,
                &self.settings,
            )?)),
        }
    }
}

/// Shared handle to a cached physical connection.
///
/// Clones refer to the same connection. A handle stays usable until the
/// caller sees a failure from it; once the cache tears the connection down,
/// operations on an old clone fail with `Closed`.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    driver: DriverKind,
    conn: Arc<Mutex<Box<dyn RemoteConnection>>>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: u64, conn: Box<dyn RemoteConnection>) -> Self {
        Self {
            id,
            driver: conn.driver(),
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Process-unique id of the underlying physical connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn driver(&self) -> DriverKind {
        self.driver
    }

    /// Whether both handles refer to the same physical connection.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }

    pub fn execute(&self, sql: &str) -> ConnResult<Cursor> {
        self.lock().execute(sql)
    }

    pub fn cancel(&self) -> ConnResult<bool> {
        self.lock().cancel()
    }

    pub(crate) fn disconnect(&self) {
        self.lock().disconnect();
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn RemoteConnection>> {
        // A panic inside a driver call leaves the driver itself consistent
        // enough to report errors or be disconnected.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnError;

    #[derive(Debug, Default)]
    struct StubConnection {
        closed: bool,
    }

    impl RemoteConnection for StubConnection {
        fn driver(&self) -> DriverKind {
            DriverKind::Binary
        }

        fn execute(&mut self, sql: &str) -> ConnResult<Cursor> {
            if self.closed {
                return Err(ConnError::Closed);
            }
            Ok(Cursor::new(
                vec![Column::new("q", "String")],
                vec![vec![Some(sql.to_string())]],
            ))
        }

        fn cancel(&mut self) -> ConnResult<bool> {
            Ok(false)
        }

        fn disconnect(&mut self) {
            self.closed = true;
        }
    }

    #[test]
    fn cursor_iterates_rows_in_order() {
        let mut cursor = Cursor::new(
            vec![Column::new("n", "UInt8")],
            vec![vec![Some("1".into())], vec![None]],
        );
        assert_eq!(cursor.columns()[0].name, "n");
        assert_eq!(cursor.remaining(), 2);
        assert_eq!(cursor.next(), Some(vec![Some("1".to_string())]));
        assert_eq!(cursor.next(), Some(vec![None]));
        assert_eq!(cursor.next(), None);
    }

    #[test]
    fn empty_cursor() {
        let cursor = Cursor::empty();
        assert!(cursor.columns().is_empty());
        assert_eq!(cursor.count(), 0);
    }

    #[test]
    fn handle_clones_share_connection() {
        let a = ConnectionHandle::new(1, Box::new(StubConnection::default()));
        let b = a.clone();
        let c = ConnectionHandle::new(2, Box::new(StubConnection::default()));
        assert!(a.same_connection(&b));
        assert!(!a.same_connection(&c));
        assert_eq!(a.driver(), DriverKind::Binary);
    }

    #[test]
    fn handle_fails_after_disconnect() {
        let handle = ConnectionHandle::new(1, Box::new(StubConnection::default()));
        let stale = handle.clone();
        let rows: Vec<Row> = handle.execute("SELECT 1").unwrap().collect();
        assert_eq!(rows, vec![vec![Some("SELECT 1".to_string())]]);

        handle.disconnect();
        assert!(matches!(stale.execute("SELECT 1"), Err(ConnError::Closed)));
        assert!(!stale.cancel().unwrap());
    }

    #[test]
    fn driver_settings_from_config() {
        let settings = ConnectionSettings {
            connect_timeout_ms: 1500,
            recv_timeout_ms: 2500,
            client_name: "chfdw-test".to_string(),
        };
        let driver = DriverSettings::from(&settings);
        assert_eq!(driver.connect_timeout, Duration::from_millis(1500));
        assert_eq!(driver.recv_timeout, Duration::from_millis(2500));
        assert_eq!(driver.client_name, "chfdw-test");
    }

    #[test]
    fn factory_reports_connect_failure_for_unreachable_binary_server() {
        let factory = DriverFactory::new(DriverSettings {
            connect_timeout: Duration::from_millis(200),
            ..DriverSettings::default()
        });
        // Port 1 on localhost is reserved and closed on test machines.
        let details = ConnectionDetails {
            driver: DriverKind::Binary,
            port: 1,
            ..ConnectionDetails::default()
        };
        let err = factory.connect(&details).unwrap_err();
        assert!(err.is_connection_exception(), "unexpected error: {err}");
    }
}
