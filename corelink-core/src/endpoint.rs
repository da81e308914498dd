//! Transport endpoint addressing: `host:port`, dotted-quad or hostname.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use thiserror::Error;

/// A resolved remote address: host (dotted-quad or hostname) plus port.
///
/// Resolution happens eagerly in [`EndPoint::parse`] via the standard
/// library's resolver, mirroring the source's `inet_pton`-then-
/// `gethostbyname` fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndPoint {
    addr: SocketAddr,
}

impl EndPoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Parse `host:port`, accepting a dotted-quad or a resolvable
    /// hostname for `host`.
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl FromStr for EndPoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(EndPoint::new(addr));
        }
        let mut addrs = s
            .to_socket_addrs()
            .map_err(|_| EndpointError::InvalidAddress(s.to_string()))?;
        addrs
            .next()
            .map(EndPoint::new)
            .ok_or_else(|| EndpointError::InvalidAddress(s.to_string()))
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid endpoint address: {0} (expected host:port)")]
    InvalidAddress(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipv4_dotted_quad() {
        let ep = EndPoint::parse("127.0.0.1:12200").unwrap();
        assert_eq!(ep.port(), 12200);
        assert_eq!(ep.to_string(), "127.0.0.1:12200");
    }

    #[test]
    fn parse_ipv6() {
        let ep = EndPoint::parse("[::1]:9000").unwrap();
        assert_eq!(ep.port(), 9000);
    }

    #[test]
    fn parse_localhost_hostname() {
        let ep = EndPoint::parse("localhost:8080").unwrap();
        assert_eq!(ep.port(), 8080);
    }

    #[test]
    fn rejects_missing_port() {
        let result = EndPoint::parse("127.0.0.1");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_out_of_range_port() {
        let result = EndPoint::parse("127.0.0.1:99999");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(EndPoint::parse("not-an-endpoint").is_err());
    }
}
