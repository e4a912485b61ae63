//! Error types produced by the proxy core.

use std::time::Duration;

use thiserror::Error;

/// A `Result` typedef to use with the [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the proxy core.
///
/// Cache errors are advisory: callers log them and fall back to treating the
/// affected key as absent. Origin errors surface to the client as a 502,
/// and [`Error::InvalidUrl`] as a 400.
#[derive(Error, Debug)]
pub enum Error {
    /// The inbound request target did not combine with the upstream base
    /// into a parseable HTTP URL.
    #[error("invalid request URL: {0}")]
    InvalidUrl(String),
    /// A cache cluster operation failed.
    #[error("cache operation failed: {0}")]
    Cache(String),
    /// The origin could not be reached or answered with a protocol error.
    #[error("origin request failed: {0}")]
    OriginUnreachable(String),
    /// The origin did not answer within the configured deadline.
    #[error("origin timed out after {0:?}")]
    OriginTimeout(Duration),
    /// Error from http
    #[error(transparent)]
    Http(#[from] http::Error),
    /// There was an error parsing the URI
    #[error(transparent)]
    InvalidUri(#[from] http::uri::InvalidUri),
    /// There was an error encoding or decoding a meta record
    #[error(transparent)]
    Encoding(#[from] Box<bincode::ErrorKind>),
    /// Error from IO
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
