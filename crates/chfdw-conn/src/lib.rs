//! chfdw-conn: remote connection lifecycle for the chfdw foreign-data layer.
//!
//! - **cache**: [`ConnectionCache`], one physical connection per
//!   (user mapping, access mode), with deferred teardown and the
//!   transaction state-change safety guard
//! - **coordinator**: [`InvalidationCoordinator`], reacting to host
//!   transaction boundaries and catalog changes
//! - **gate**: the uniform connection handle and the HTTP / native drivers
//! - **host**: the host-environment interface and [`LocalHost`]

pub mod cache;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod host;

pub use cache::{CacheStats, ConnectionCache, EntryState, XactStateChange};
pub use coordinator::InvalidationCoordinator;
pub use error::{ConnError, ConnResult};
pub use gate::{
    Column, ConnectionFactory, ConnectionHandle, Cursor, DriverFactory, DriverSettings,
    RemoteConnection, Row,
};
pub use host::{HostEnvironment, HostEventSubscriber, LocalHost, SubXactEvent, XactEvent};
