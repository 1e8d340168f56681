//! [`XrdUrl`] — immutable endpoint descriptor.
//!
//! `root://host[:port][/path][?key=value&...]` — the scheme and path are
//! accepted and ignored; what identifies a stream is `host:port` plus the
//! query parameters that tune its connection behaviour.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorKind, Result, XrdError};

/// Default xrootd service port.
pub const DEFAULT_PORT: u16 = 1094;

// ---------------------------------------------------------------------------
// XrdUrl
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrdUrl {
    // ---
    host: String,
    port: u16,
    params: HashMap<String, String>,
}

// ---

impl XrdUrl {
    // ---

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    // ---

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` — the stream name used in logs and as the channel key.
    pub fn host_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    // ---

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// A query parameter parsed to a concrete type, `None` when absent or
    /// unparsable.
    pub fn typed_param<T: FromStr>(&self, key: &str) -> Option<T> {
        self.param(key).and_then(|v| v.parse().ok())
    }
}

// ---

impl FromStr for XrdUrl {
    type Err = XrdError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        let rest = s.strip_prefix("root://").or_else(|| s.strip_prefix("xroot://")).unwrap_or(s);

        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };

        // Drop any path component after the authority.
        let authority = authority.split('/').next().unwrap_or("");
        if authority.is_empty() {
            return Err(XrdError::new(ErrorKind::LocalError));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| XrdError::new(ErrorKind::LocalError))?;
                (h, port)
            }
            None => (authority, DEFAULT_PORT),
        };

        let mut params = HashMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((k, v)) => params.insert(k.to_string(), v.to_string()),
                    None => params.insert(pair.to_string(), String::new()),
                };
            }
        }

        Ok(Self {
            host: host.to_string(),
            port,
            params,
        })
    }
}

// ---

impl fmt::Display for XrdUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "root://{}:{}", self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
