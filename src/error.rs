//! Error types.

use std::path::PathBuf;
use trust_dns_server::proto::error::ProtoError;

/// Error enumerates the possible ruleserv error states.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Returned when a generic IO error occurs.
    #[error("an IO error occurred")]
    IO(#[from] std::io::Error),

    /// Returned when processing JSON from disk (e.g. [loading a `Config`][crate::config::Config::try_from_file],
    /// a descriptor document or a plugin unit manifest) fails due to invalid JSON content.
    #[error("invalid JSON")]
    InvalidJSON(#[from] serde_json::Error),

    /// Returned when a descriptor `route` (or an action `rewrite`/`replace` pattern) is not a
    /// valid regular expression.
    #[error("invalid regular expression")]
    InvalidRegex(#[from] regex::Error),

    /// Returned when a configured descriptor source is not a valid glob pattern.
    #[error("invalid glob pattern")]
    InvalidGlob(#[from] glob::PatternError),

    /// Returned when a descriptor document is valid JSON but not an array of objects.
    #[error("descriptor document {0} must be a JSON array of objects")]
    InvalidDocument(PathBuf),

    /// Returned when the [`Config`][crate::config::Config] can't be used to start services, e.g.
    /// there are no services, or the files root does not exist.
    #[error("configuration error: {0}")]
    Config(String),

    /// Returned when certificate or key material for a TLS listener is missing or unusable.
    #[error("unable to load TLS certificate information: {0}")]
    Tls(String),

    /// Returned when a computed path resolves outside of the sandbox root.
    #[error("attempted to load {0} from outside the files root")]
    SandboxEscape(PathBuf),

    /// Returned when a plugin unit manifest names a plugin that isn't registered.
    #[error("unknown plugin \"{name}\" in {path}")]
    UnknownPlugin { name: String, path: PathBuf },

    /// Returned when a plugin unit doesn't provide the entry point a caller needs.
    #[error("plugin unit {path} does not export {entry}")]
    MissingEntryPoint { path: PathBuf, entry: &'static str },

    /// Returned when a plugin factory or entry point fails.
    #[error("plugin unit {path} failed: {source}")]
    Plugin {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Returned when a DNS response value can't be turned into a record of the resolved type.
    #[error("DNS {record} response: {reason}")]
    Record { record: String, reason: String },

    /// Returned when the DNS server encounters a generic DNS protocol error.
    #[error("DNS error")]
    DNSError(#[from] ProtoError),

    /// Returned when a URL given to the `route` command, or a `forward` destination, can't be
    /// used.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Returned when work handed to the blocking thread pool panicked or was cancelled.
    #[error("background task failed")]
    Task(#[from] tokio::task::JoinError),

    /// Returned when a forwarded request fails before any response arrived.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl Error {
    pub(crate) fn record(record: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Record {
            record: record.into(),
            reason: reason.into(),
        }
    }
}
