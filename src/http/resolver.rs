//! Destination resolution for inbound requests.
//!
//! # Responsibilities
//! - Pick the upstream a request is forwarded to
//!
//! # Design Decisions
//! - A configured upstream always wins
//! - Otherwise absolute-form targets name their own destination
//! - Otherwise the `Host` header is used, over plain http
//! - A resolved destination that is the proxy's own listener is refused;
//!   only literal addresses and `localhost` are recognised

use hyper::header::HOST;
use hyper::Request;
use std::net::{IpAddr, SocketAddr};

use crate::config::UpstreamConfig;
use crate::pool::{Destination, DestinationError, Scheme};

#[derive(Debug, Clone, Default)]
pub struct DestinationResolver {
    fixed: Option<Destination>,
    listener: Option<SocketAddr>,
}

impl DestinationResolver {
    pub fn new(fixed: Option<Destination>) -> Self {
        Self {
            fixed,
            listener: None,
        }
    }

    /// Refuse destinations that resolve back to `addr`.
    pub fn with_listener(mut self, addr: SocketAddr) -> Self {
        self.listener = Some(addr);
        self
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self, DestinationError> {
        let fixed = config.address.as_deref().map(str::parse::<Destination>).transpose()?;
        Ok(Self::new(fixed))
    }

    pub fn fixed(&self) -> Option<&Destination> {
        self.fixed.as_ref()
    }

    pub fn resolve<B>(&self, request: &Request<B>) -> Result<Destination, DestinationError> {
        if let Some(fixed) = &self.fixed {
            return Ok(fixed.clone());
        }

        let destination = self.target(request)?;
        if self.is_listener(&destination) {
            return Err(DestinationError::SelfReferential(destination.to_string()));
        }
        Ok(destination)
    }

    fn target<B>(&self, request: &Request<B>) -> Result<Destination, DestinationError> {
        let uri = request.uri();
        if uri.authority().is_some() {
            return Destination::from_uri(uri);
        }

        let host = request
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DestinationError::MissingHost(uri.to_string()))?;
        Destination::from_authority(Scheme::Http, host)
    }

    fn is_listener(&self, destination: &Destination) -> bool {
        let Some(listener) = self.listener else {
            return false;
        };
        if destination.port() != listener.port() {
            return false;
        }

        let host = destination.host().trim_start_matches('[').trim_end_matches(']');
        if host == "localhost" {
            return true;
        }
        let Ok(ip) = host.parse::<IpAddr>() else {
            return false;
        };
        if listener.ip().is_unspecified() {
            ip.is_loopback() || ip.is_unspecified()
        } else {
            ip == listener.ip() || (ip.is_loopback() && listener.ip().is_loopback())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, host: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_fixed_upstream_wins() {
        let resolver = DestinationResolver::from_config(&UpstreamConfig {
            address: Some("http://10.0.0.5:8080".to_string()),
        })
        .unwrap();
        let dest = resolver
            .resolve(&request("http://other.example/x", Some("third.example")))
            .unwrap();
        assert_eq!(dest, Destination::http("10.0.0.5", 8080));
    }

    #[test]
    fn test_absolute_uri_then_host_header() {
        let resolver = DestinationResolver::default();

        let dest = resolver.resolve(&request("http://api.example:9000/v1", None)).unwrap();
        assert_eq!(dest, Destination::http("api.example", 9000));

        let dest = resolver.resolve(&request("/v1", Some("App.Example:8081"))).unwrap();
        assert_eq!(dest, Destination::http("app.example", 8081));

        let dest = resolver.resolve(&request("/v1", Some("app.example"))).unwrap();
        assert_eq!(dest.port(), 80);
    }

    #[test]
    fn test_missing_host_is_rejected() {
        let resolver = DestinationResolver::default();
        assert!(matches!(
            resolver.resolve(&request("/v1", None)),
            Err(DestinationError::MissingHost(_))
        ));
        assert!(resolver.resolve(&request("/v1", Some("bad host/"))).is_err());
    }

    #[test]
    fn test_own_listener_is_refused() {
        let resolver = DestinationResolver::default().with_listener("0.0.0.0:8080".parse().unwrap());

        for host in ["127.0.0.1:8080", "localhost:8080", "[::1]:8080"] {
            assert!(
                matches!(
                    resolver.resolve(&request("/", Some(host))),
                    Err(DestinationError::SelfReferential(_))
                ),
                "{} should be refused",
                host
            );
        }
        assert!(resolver.resolve(&request("http://127.0.0.1:8080/", None)).is_err());

        assert!(resolver.resolve(&request("/", Some("127.0.0.1:8081"))).is_ok());
        assert!(resolver.resolve(&request("/", Some("api.example:8080"))).is_ok());
    }

    #[test]
    fn test_fixed_upstream_skips_listener_check() {
        let resolver = DestinationResolver::new(Some(Destination::http("127.0.0.1", 8080)))
            .with_listener("127.0.0.1:8080".parse().unwrap());
        assert!(resolver.resolve(&request("/", Some("127.0.0.1:8080"))).is_ok());
    }
}
