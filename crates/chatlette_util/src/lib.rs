#![forbid(unsafe_code)]

pub mod secret {
	use std::fmt;

	/// Wrapper that redacts in logs.
	#[derive(Clone, PartialEq, Eq)]
	pub struct SecretString(String);

	impl SecretString {
		pub fn new(s: impl Into<String>) -> Self {
			Self(s.into())
		}

		/// Access the inner secret string.
		pub fn expose(&self) -> &str {
			&self.0
		}
	}

	impl fmt::Debug for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("SecretString(<redacted>)")
		}
	}

	impl fmt::Display for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("<redacted>")
		}
	}

}

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `ws://host:port` listen endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl WsEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse a listen endpoint in the form `ws://host:port`.
		///
		/// A bare `host:port` is accepted as well. Paths are rejected; routing is
		/// configured separately.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			if s.starts_with("wss://") {
				return Err(format!("TLS endpoints are not served directly; terminate TLS upstream: {s}"));
			}

			let rest = match s.split_once("://") {
				Some(("ws", rest)) => rest,
				Some((scheme, _)) => return Err(format!("unsupported scheme {scheme:?} (expected ws://host:port)")),
				None => s,
			};

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected ws://host:port without path/query/fragment): {s}"
				));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected ws://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected ws://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like ws://[::1]:8000): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn ws_scheme_is_optional() {
			let with_scheme = WsEndpoint::parse("ws://127.0.0.1:8000").unwrap();
			assert_eq!(with_scheme, WsEndpoint::parse("127.0.0.1:8000").unwrap());
			assert_eq!(with_scheme.to_socket_addr_if_ip_literal().unwrap().to_string(), "127.0.0.1:8000");
		}

		#[test]
		fn tls_and_foreign_schemes_are_rejected() {
			assert!(WsEndpoint::parse("wss://127.0.0.1:8443").unwrap_err().contains("TLS"));
			assert!(WsEndpoint::parse("quic://127.0.0.1:8000").unwrap_err().contains("unsupported scheme"));
		}

		#[test]
		fn route_paths_belong_in_config() {
			assert!(WsEndpoint::parse("ws://127.0.0.1:8000/ws").is_err());
		}
	}
}
