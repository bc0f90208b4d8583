//! chfdw-core: shared types for the chfdw connection substrate.
//!
//! Provides the pieces every other crate leans on:
//! - **types**: catalog object identifiers and the connection identity key
//! - **catalog**: foreign servers, user mappings and their metadata fingerprints
//! - **options**: merging server-level and user-level option sets into a
//!   [`ConnectionDetails`] descriptor
//! - **config**: `chfdw.toml` parsing

pub mod catalog;
pub mod config;
pub mod error;
pub mod options;
pub mod types;

pub use catalog::{Catalog, ForeignServer, OptionSet, UserMapping};
pub use config::FdwConfig;
pub use error::{ConfigError, ConfigResult, OptionsError, OptionsResult};
pub use options::{ConnectionDetails, DriverKind};
pub use types::*;
