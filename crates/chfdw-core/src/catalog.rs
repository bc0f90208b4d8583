//! Catalog model: foreign servers, user mappings and their option sets.
//!
//! The [`Catalog`] is a plain in-memory store. Hosts that keep their
//! catalog elsewhere only need to hand out the same [`ForeignServer`] /
//! [`UserMapping`] values and a stable [`Fingerprint`] per object.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::types::{CatalogCacheId, Fingerprint, MappingId, ServerId, UserId};

/// Ordered list of `key = value` options. Setting an existing key replaces
/// its value in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OptionSet {
    entries: Vec<(String, String)>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, replacing any earlier value for the same key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder form of [`OptionSet::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for OptionSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = OptionSet::new();
        for (k, v) in iter {
            set.set(k, v);
        }
        set
    }
}

/// A remote server definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForeignServer {
    pub id: ServerId,
    pub name: String,
    pub options: OptionSet,
}

/// Credentials of one local role on one foreign server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserMapping {
    pub id: MappingId,
    pub user: UserId,
    pub server: ServerId,
    pub options: OptionSet,
}

/// Stable, non-zero fingerprint of a catalog object.
///
/// Derived from the object identity only, so altering an object's options
/// keeps its fingerprint. Invalidation messages carry this value.
pub fn object_fingerprint(cache: CatalogCacheId, id: u32) -> Fingerprint {
    let mut hasher = DefaultHasher::new();
    cache.hash(&mut hasher);
    id.hash(&mut hasher);
    let hash = hasher.finish();
    let folded = (hash as u32) ^ ((hash >> 32) as u32);
    // 0 means "invalidate everything".
    if folded == 0 { 1 } else { folded }
}

/// In-memory catalog of roles, foreign servers and user mappings.
#[derive(Debug, Default)]
pub struct Catalog {
    roles: Vec<String>,
    servers: HashMap<ServerId, ForeignServer>,
    mappings: HashMap<MappingId, UserMapping>,
    next_oid: u32,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            next_oid: 1,
            ..Self::default()
        }
    }

    fn allocate_oid(&mut self) -> u32 {
        let oid = self.next_oid.max(1);
        self.next_oid = oid + 1;
        oid
    }

    /// Look up a role by name, creating it on first use.
    pub fn role(&mut self, name: &str) -> UserId {
        if let Some(pos) = self.roles.iter().position(|r| r == name) {
            return UserId(pos as u32 + 1);
        }
        self.roles.push(name.to_string());
        UserId(self.roles.len() as u32)
    }

    pub fn role_name(&self, id: UserId) -> Option<&str> {
        let idx = (id.0 as usize).checked_sub(1)?;
        self.roles.get(idx).map(String::as_str)
    }

    /// Define a new foreign server. Returns `None` if the name is taken.
    pub fn create_server(&mut self, name: &str, options: OptionSet) -> Option<ServerId> {
        if self.server_by_name(name).is_some() {
            return None;
        }
        let id = ServerId(self.allocate_oid());
        self.servers.insert(
            id,
            ForeignServer {
                id,
                name: name.to_string(),
                options,
            },
        );
        Some(id)
    }

    /// Define a user mapping. Returns `None` if the server is unknown or the
    /// user already has a mapping on it.
    pub fn create_user_mapping(
        &mut self,
        user: UserId,
        server: ServerId,
        options: OptionSet,
    ) -> Option<MappingId> {
        if !self.servers.contains_key(&server) || self.find_user_mapping(user, server).is_some() {
            return None;
        }
        let id = MappingId(self.allocate_oid());
        self.mappings.insert(
            id,
            UserMapping {
                id,
                user,
                server,
                options,
            },
        );
        Some(id)
    }

    pub fn server(&self, id: ServerId) -> Option<&ForeignServer> {
        self.servers.get(&id)
    }

    pub fn server_by_name(&self, name: &str) -> Option<&ForeignServer> {
        self.servers.values().find(|s| s.name == name)
    }

    pub fn user_mapping(&self, id: MappingId) -> Option<&UserMapping> {
        self.mappings.get(&id)
    }

    pub fn find_user_mapping(&self, user: UserId, server: ServerId) -> Option<&UserMapping> {
        self.mappings
            .values()
            .find(|m| m.user == user && m.server == server)
    }

    /// All user mappings, ordered by id.
    pub fn user_mappings(&self) -> Vec<&UserMapping> {
        let mut all: Vec<&UserMapping> = self.mappings.values().collect();
        all.sort_by_key(|m| m.id);
        all
    }

    /// Replace a server's options. Returns the server's fingerprint so the
    /// caller can broadcast the change.
    pub fn alter_server_options(&mut self, id: ServerId, options: OptionSet) -> Option<Fingerprint> {
        let server = self.servers.get_mut(&id)?;
        server.options = options;
        Some(self.fingerprint(CatalogCacheId::ForeignServer, id.0))
    }

    /// Replace a user mapping's options. Returns the mapping's fingerprint.
    pub fn alter_user_mapping_options(
        &mut self,
        id: MappingId,
        options: OptionSet,
    ) -> Option<Fingerprint> {
        let mapping = self.mappings.get_mut(&id)?;
        mapping.options = options;
        Some(self.fingerprint(CatalogCacheId::UserMapping, id.0))
    }

    /// Fingerprint of the given object in the given catalog.
    pub fn fingerprint(&self, cache: CatalogCacheId, id: u32) -> Fingerprint {
        object_fingerprint(cache, id)
    }
}
