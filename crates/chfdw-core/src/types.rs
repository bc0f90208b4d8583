//! Catalog identifiers and the connection identity key.

use std::fmt;

/// Identifier of a foreign server definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub u32);

/// Identifier of a user mapping (the credential identity).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MappingId(pub u32);

/// Identifier of a local role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Catalog whose changes can invalidate cached connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CatalogCacheId {
    ForeignServer,
    UserMapping,
}

impl fmt::Display for CatalogCacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogCacheId::ForeignServer => write!(f, "foreign_server"),
            CatalogCacheId::UserMapping => write!(f, "user_mapping"),
        }
    }
}

/// Metadata version of a catalog object. `0` is reserved for "reset everything".
pub type Fingerprint = u32;

/// Fingerprint carried by a cache-reset notification.
pub const RESET_FINGERPRINT: Fingerprint = 0;

/// Key selecting a connection cache slot: credential identity plus access mode.
///
/// A read connection and a read-write connection for the same mapping are
/// different slots and never share a physical connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub mapping: MappingId,
    pub read: bool,
}

impl ConnKey {
    pub fn new(mapping: MappingId, read: bool) -> Self {
        Self { mapping, read }
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.read { "read" } else { "write" };
        write!(f, "{}/{}", self.mapping, mode)
    }
}
