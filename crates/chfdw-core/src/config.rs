//! chfdw.toml configuration parser.
//!
//! ```toml
//! [connection]
//! connect_timeout_ms = 10000
//!
//! [[server]]
//! name = "clickhouse_svr"
//! options = { host = "127.0.0.1", port = 8123, dbname = "regression" }
//!
//! [[user_mapping]]
//! user = "postgres"
//! server = "clickhouse_svr"
//! options = { username = "default" }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::catalog::{Catalog, OptionSet};
use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FdwConfig {
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,
    #[serde(default, rename = "user_mapping")]
    pub user_mappings: Vec<UserMappingConfig>,
}

/// Driver tunables shared by every connection the process opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub connect_timeout_ms: u64,
    pub recv_timeout_ms: u64,
    pub client_name: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            recv_timeout_ms: 30_000,
            client_name: "chfdw".to_string(),
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default)]
    pub options: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMappingConfig {
    pub user: String,
    pub server: String,
    #[serde(default)]
    pub options: BTreeMap<String, toml::Value>,
}

impl FdwConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Build the in-memory catalog described by this file.
    pub fn build_catalog(&self) -> ConfigResult<Catalog> {
        let mut catalog = Catalog::new();

        for server in &self.servers {
            let options = to_option_set(&server.options)?;
            catalog
                .create_server(&server.name, options)
                .ok_or_else(|| ConfigError::DuplicateServer(server.name.clone()))?;
        }

        for mapping in &self.user_mappings {
            let server = catalog
                .server_by_name(&mapping.server)
                .map(|s| s.id)
                .ok_or_else(|| ConfigError::UnknownServer {
                    user: mapping.user.clone(),
                    server: mapping.server.clone(),
                })?;
            let user = catalog.role(&mapping.user);
            let options = to_option_set(&mapping.options)?;
            catalog
                .create_user_mapping(user, server, options)
                .ok_or_else(|| ConfigError::DuplicateMapping {
                    user: mapping.user.clone(),
                    server: mapping.server.clone(),
                })?;
        }

        Ok(catalog)
    }
}

fn to_option_set(values: &BTreeMap<String, toml::Value>) -> ConfigResult<OptionSet> {
    let mut options = OptionSet::new();
    for (key, value) in values {
        let text = match value {
            toml::Value::String(s) => s.clone(),
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            _ => return Err(ConfigError::UnsupportedValue(key.clone())),
        };
        options.set(key.as_str(), text);
    }
    Ok(options)
}
