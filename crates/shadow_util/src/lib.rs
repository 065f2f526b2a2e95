#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::{SocketAddr, ToSocketAddrs};

	use thiserror::Error;

	pub const SCHEME: &str = "quic://";

	#[derive(Debug, Error, Clone, PartialEq, Eq)]
	pub enum EndpointError {
		#[error("endpoint must be non-empty (expected quic://host:port)")]
		Empty,
		#[error("endpoint must start with quic:// : {0}")]
		Scheme(String),
		#[error("endpoint must not carry a path, query or fragment: {0}")]
		Trailing(String),
		#[error("endpoint is missing :port: {0}")]
		MissingPort(String),
		#[error("endpoint host is empty: {0}")]
		EmptyHost(String),
		#[error("IPv6 hosts must be bracketed, e.g. quic://[::1]:7878: {0}")]
		UnbracketedIpv6(String),
		#[error("endpoint port must be 1..=65535: {0}")]
		BadPort(String),
		#[error("could not resolve {host}: {reason}")]
		Resolve { host: String, reason: String },
	}

	/// A relay address in `quic://host:port` form.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct RelayEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl RelayEndpoint {
		pub fn parse(s: &str) -> Result<Self, EndpointError> {
			let s = s.trim();
			if s.is_empty() {
				return Err(EndpointError::Empty);
			}

			let rest = s.strip_prefix(SCHEME).ok_or_else(|| EndpointError::Scheme(s.to_string()))?;
			if rest.contains(['/', '?', '#']) {
				return Err(EndpointError::Trailing(s.to_string()));
			}

			let (host, port) = rest
				.rsplit_once(':')
				.ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(EndpointError::EmptyHost(s.to_string()));
			}
			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(EndpointError::UnbracketedIpv6(s.to_string()));
			}

			let port = match port.trim().parse::<u16>() {
				Ok(p) if p != 0 => p,
				_ => return Err(EndpointError::BadPort(s.to_string())),
			};

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}

		/// `host:port`, IPv6 kept bracketed.
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Host as used for TLS server name checks (brackets stripped).
		pub fn server_name(&self) -> &str {
			self.host
				.strip_prefix('[')
				.and_then(|h| h.strip_suffix(']'))
				.unwrap_or(&self.host)
		}

		/// Resolve to the first socket address. Blocks on DNS for non-literal hosts.
		pub fn resolve(&self) -> Result<SocketAddr, EndpointError> {
			if let Ok(addr) = self.hostport().parse::<SocketAddr>() {
				return Ok(addr);
			}

			let resolve_err = |reason: String| EndpointError::Resolve {
				host: self.host.clone(),
				reason,
			};
			self.hostport()
				.to_socket_addrs()
				.map_err(|e| resolve_err(e.to_string()))?
				.next()
				.ok_or_else(|| resolve_err("no addresses".to_string()))
		}
	}

	impl std::fmt::Display for RelayEndpoint {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			write!(f, "{SCHEME}{}", self.hostport())
		}
	}

	impl std::str::FromStr for RelayEndpoint {
		type Err = EndpointError;

		fn from_str(s: &str) -> Result<Self, Self::Err> {
			Self::parse(s)
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_hosts() {
			let e = RelayEndpoint::parse("quic://relay.example.com:443").unwrap();
			assert_eq!(e.hostport(), "relay.example.com:443");
			assert_eq!(e.server_name(), "relay.example.com");

			let e = RelayEndpoint::parse(" quic://127.0.0.1:7878 ").unwrap();
			assert_eq!(e.port, 7878);
			assert_eq!(e.to_string(), "quic://127.0.0.1:7878");

			let e = RelayEndpoint::parse("quic://[::1]:7878").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.server_name(), "::1");
		}

		#[test]
		fn rejects_malformed() {
			assert_eq!(RelayEndpoint::parse(""), Err(EndpointError::Empty));
			assert!(matches!(
				RelayEndpoint::parse("https://a:1"),
				Err(EndpointError::Scheme(_))
			));
			assert!(matches!(
				RelayEndpoint::parse("quic://a:1/x"),
				Err(EndpointError::Trailing(_))
			));
			assert!(matches!(
				RelayEndpoint::parse("quic://127.0.0.1"),
				Err(EndpointError::MissingPort(_))
			));
			assert!(matches!(
				RelayEndpoint::parse("quic://::1:7878"),
				Err(EndpointError::UnbracketedIpv6(_))
			));
			assert!(matches!(
				RelayEndpoint::parse("quic://a:0"),
				Err(EndpointError::BadPort(_))
			));
		}

		#[test]
		fn resolves_ip_literals_without_dns() {
			let a = RelayEndpoint::parse("quic://[::1]:7878").unwrap().resolve().unwrap();
			assert_eq!(a.to_string(), "[::1]:7878");
		}
	}
}

pub use endpoint::{EndpointError, RelayEndpoint};
