use std::path::PathBuf;

/// Errors raised by the handful of operations that have an obvious synchronous
/// caller to report back to (config loading, link setup, user-initiated datalogging
/// requests). Everything that happens once a session is running surfaces through
/// status predicates and log lines instead, per the core's failure model.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("link error: {0}")]
    Link(String),

    #[error("{0}")]
    Logical(String),
}

pub type Result<T> = std::result::Result<T, Error>;
