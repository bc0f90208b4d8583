//! Connection option resolution.
//!
//! Server-level options are applied first, then user-mapping options, so a
//! key present in both sets takes the user-level value. Resolution happens
//! when a connection is about to be established; every problem it finds is a
//! configuration error and is never retried.

use std::fmt;
use std::str::FromStr;

use crate::catalog::OptionSet;
use crate::error::{OptionsError, OptionsResult};

/// Default host when no `host` option is given.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default database when no `dbname` option is given.
pub const DEFAULT_DATABASE: &str = "default";

/// Wire driver used to talk to the remote engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum DriverKind {
    /// HTTP interface; credentials travel in the connection URI.
    #[default]
    Http,
    /// Native binary protocol; credentials are sent in the handshake.
    Binary,
}

impl DriverKind {
    /// Port used when the options leave `port` unset.
    pub fn default_port(self, secure: bool) -> u16 {
        match (self, secure) {
            (DriverKind::Http, false) => 8123,
            (DriverKind::Http, true) => 8443,
            (DriverKind::Binary, false) => 9000,
            (DriverKind::Binary, true) => 9440,
        }
    }
}

impl FromStr for DriverKind {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(DriverKind::Http),
            "binary" => Ok(DriverKind::Binary),
            other => Err(OptionsError::UnknownDriver(other.to_string())),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Http => write!(f, "http"),
            DriverKind::Binary => write!(f, "binary"),
        }
    }
}

/// Normalized connection descriptor produced from the merged option sets.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDetails {
    pub driver: DriverKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub secure: bool,
}

impl Default for ConnectionDetails {
    fn default() -> Self {
        Self {
            driver: DriverKind::Http,
            host: DEFAULT_HOST.to_string(),
            port: DriverKind::Http.default_port(false),
            database: DEFAULT_DATABASE.to_string(),
            username: None,
            password: None,
            secure: false,
        }
    }
}

// Hand-written so passwords never reach a log line.
impl fmt::Debug for ConnectionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDetails")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("secure", &self.secure)
            .finish()
    }
}

/// Option values collected from one or more sets before defaults apply.
#[derive(Default)]
struct Collected<'a> {
    driver: Option<&'a str>,
    host: Option<&'a str>,
    port: Option<&'a str>,
    database: Option<&'a str>,
    username: Option<&'a str>,
    password: Option<&'a str>,
    secure: Option<&'a str>,
}

impl<'a> Collected<'a> {
    fn apply(&mut self, options: &'a OptionSet) -> OptionsResult<()> {
        for (key, value) in options.iter() {
            match key {
                "driver" => self.driver = Some(value),
                "host" => self.host = Some(value),
                "port" => self.port = Some(value),
                "dbname" => self.database = Some(value),
                "username" => self.username = Some(value),
                "password" => self.password = Some(value),
                "secure" => self.secure = Some(value),
                other => return Err(OptionsError::UnknownOption(other.to_string())),
            }
        }
        Ok(())
    }
}

impl ConnectionDetails {
    /// Merge server-level then user-level options into a descriptor.
    pub fn resolve(server: &OptionSet, user: &OptionSet) -> OptionsResult<Self> {
        let mut collected = Collected::default();
        collected.apply(server)?;
        collected.apply(user)?;

        let driver = match collected.driver {
            Some(name) => name.parse()?,
            None => DriverKind::default(),
        };
        let secure = match collected.secure {
            Some(value) => parse_bool("secure", value)?,
            None => false,
        };
        let port = match collected.port {
            Some(value) => parse_port(value)?,
            None => driver.default_port(secure),
        };
        let host = non_empty("host", collected.host.unwrap_or(DEFAULT_HOST))?;
        let database = non_empty("dbname", collected.database.unwrap_or(DEFAULT_DATABASE))?;

        Ok(Self {
            driver,
            host,
            port,
            database,
            username: collected.username.map(str::to_string),
            password: collected.password.map(str::to_string),
            secure,
        })
    }

    /// `host:port` of the remote endpoint.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn non_empty(option: &'static str, value: &str) -> OptionsResult<String> {
    if value.trim().is_empty() {
        return Err(OptionsError::MissingOption(option));
    }
    Ok(value.to_string())
}

fn parse_port(value: &str) -> OptionsResult<u16> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(OptionsError::InvalidValue {
            option: "port",
            value: value.to_string(),
        }),
    }
}

fn parse_bool(option: &'static str, value: &str) -> OptionsResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(OptionsError::InvalidValue {
            option,
            value: value.to_string(),
        }),
    }
}
