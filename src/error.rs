//! Error types for the reqwest-proxy-rotation crate.

use thiserror::Error;

/// Error returned when a proxy definition cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty proxy definition")]
    Empty,
    #[error("missing port in `{0}`")]
    MissingPort(String),
    #[error("invalid port `{0}`")]
    InvalidPort(String),
    #[error("invalid host `{0}`")]
    InvalidHost(String),
    #[error("unsupported proxy scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("unexpected layout in `{0}`")]
    UnexpectedSegments(String),
    #[error("password without username in `{0}`")]
    PasswordWithoutUsername(String),
}

/// Error returned when no eligible proxy is left in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NoProxyAvailable {
    /// The pool holds no proxies at all.
    #[error("No proxy configured in pool")]
    Empty,
    /// Every proxy has been marked dead.
    #[error("All proxies in pool are dead")]
    AllDead,
    /// Every live proxy is cooling down after a rate limit.
    #[error("All live proxies are cooling down after rate limits")]
    AllCoolingDown,
    /// Live proxies remain but none passed its health check on this pass.
    #[error("No live proxy passed its health check")]
    HealthCheckFailed,
}

/// Errors raised while loading or persisting proxy lists.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to fetch proxy list: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
