//! Error types for option resolution and configuration loading.

use thiserror::Error;

/// Result type alias for option resolution.
pub type OptionsResult<T> = Result<T, OptionsError>;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Invalid connection options. Always fatal at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionsError {
    #[error("invalid connection driver \"{0}\" (expected \"http\" or \"binary\")")]
    UnknownDriver(String),

    #[error("invalid option \"{0}\"")]
    UnknownOption(String),

    #[error("invalid value for option \"{option}\": \"{value}\"")]
    InvalidValue { option: &'static str, value: String },

    #[error("option \"{0}\" must not be empty")]
    MissingOption(&'static str),
}

/// Errors raised while loading a `chfdw.toml` file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("duplicate server: {0}")]
    DuplicateServer(String),

    #[error("duplicate user mapping for user \"{user}\" on server \"{server}\"")]
    DuplicateMapping { user: String, server: String },

    #[error("user mapping for \"{user}\" references unknown server \"{server}\"")]
    UnknownServer { user: String, server: String },

    #[error("unsupported value for option \"{0}\" (expected string, integer or boolean)")]
    UnsupportedValue(String),
}
