//! Upstream destination identity.
//!
//! A `Destination` is the pool key: two requests share connections only if
//! scheme, host and port all match. Hosts are lower-cased on construction so
//! `Example.COM` and `example.com` land in the same shard.

use hyper::Uri;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Upstream URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Port used when the authority carries none.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for destination parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DestinationError {
    #[error("unsupported scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("missing host in '{0}'")]
    MissingHost(String),

    #[error("invalid address '{0}'")]
    Invalid(String),

    #[error("destination '{0}' is this proxy")]
    SelfReferential(String),
}

/// Identifies one upstream server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Destination {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Plain-http destination, the common case for tests and local upstreams.
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Http, host, port)
    }

    /// Derive the destination from an absolute request URI.
    pub fn from_uri(uri: &Uri) -> Result<Self, DestinationError> {
        let scheme = match uri.scheme_str() {
            Some(s) => parse_scheme(s)?,
            None => Scheme::Http,
        };
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DestinationError::MissingHost(uri.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());
        Ok(Self::new(scheme, host, port))
    }

    /// Derive the destination from a bare `host[:port]` authority.
    pub fn from_authority(scheme: Scheme, authority: &str) -> Result<Self, DestinationError> {
        let uri: Uri = format!("{}://{}", scheme, authority)
            .parse()
            .map_err(|_| DestinationError::Invalid(authority.to_string()))?;
        if uri.path() != "/" || uri.query().is_some() {
            return Err(DestinationError::Invalid(authority.to_string()));
        }
        Self::from_uri(&uri)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for a `Host` header; the port is omitted when it is the scheme default.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            self.authority()
        }
    }
}

fn parse_scheme(s: &str) -> Result<Scheme, DestinationError> {
    if s.eq_ignore_ascii_case("http") {
        Ok(Scheme::Http)
    } else if s.eq_ignore_ascii_case("https") {
        Ok(Scheme::Https)
    } else {
        Err(DestinationError::UnsupportedScheme(s.to_string()))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

impl FromStr for Destination {
    type Err = DestinationError;

    /// Accepts `scheme://host[:port]` or `host[:port]` (plain http).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = parse_scheme(scheme)?;
                Self::from_authority(scheme, rest.trim_end_matches('/'))
            }
            None => Self::from_authority(Scheme::Http, s),
        }
    }
}
