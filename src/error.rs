use core::fmt;
use std::{
    error::Error,
    fmt::{Debug, Display, Formatter},
};

pub struct CleanError(pub Box<dyn Error>);

impl Debug for CleanError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "\r\x1b[K{}", self)
    }
}

impl Display for CleanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\x1b[31mERROR\x1b[0m: {}", self.0)
    }
}

impl Error for CleanError {}

impl From<crate::config::ConfigError> for CleanError {
    fn from(e: crate::config::ConfigError) -> Self {
        CleanError(Box::new(e))
    }
}

impl From<std::io::Error> for CleanError {
    fn from(e: std::io::Error) -> Self {
        CleanError(Box::new(e))
    }
}

impl From<std::net::AddrParseError> for CleanError {
    fn from(e: std::net::AddrParseError) -> Self {
        CleanError(Box::new(e))
    }
}

impl From<String> for CleanError {
    fn from(s: String) -> Self {
        CleanError(Box::new(GenericError(s)))
    }
}

impl From<&str> for CleanError {
    fn from(s: &str) -> Self {
        CleanError(Box::new(GenericError(s.to_string())))
    }
}

impl From<ServerError> for CleanError {
    fn from(e: ServerError) -> Self {
        CleanError(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, CleanError>;

#[derive(Debug)]
struct GenericError(String);

impl Display for GenericError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for GenericError {}

/// Internal error taxonomy for the connection and FastCGI layers, distinct
/// from `CleanError` (which is the top-level, process-exit-facing wrapper).
/// Each variant maps to exactly one HTTP status at the point a state machine
/// gives up on a request, so callers never match on strings.
#[derive(Debug)]
pub enum ServerError {
    /// Backend hiccup worth a retry against a different process (502).
    Transient(String),
    /// Every process for a host is over its load ceiling (503).
    Overload,
    /// A host has no running or startable process (503).
    BackendDead(String),
    /// Malformed FastCGI record or header from a backend (502).
    Protocol(String),
    /// Local resource limit hit: fd table, tempfile quota, process table (503).
    ResourceExhausted(String),
    /// Not recoverable within the request; connection must close (500).
    Fatal(String),
}

impl ServerError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::Transient(_) => 502,
            ServerError::Overload => 503,
            ServerError::BackendDead(_) => 503,
            ServerError::Protocol(_) => 502,
            ServerError::ResourceExhausted(_) => 503,
            ServerError::Fatal(_) => 500,
        }
    }
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Transient(s) => write!(f, "transient backend error: {s}"),
            ServerError::Overload => write!(f, "backend overloaded"),
            ServerError::BackendDead(s) => write!(f, "backend dead: {s}"),
            ServerError::Protocol(s) => write!(f, "protocol error: {s}"),
            ServerError::ResourceExhausted(s) => write!(f, "resource exhausted: {s}"),
            ServerError::Fatal(s) => write!(f, "fatal: {s}"),
        }
    }
}

impl Error for ServerError {}
