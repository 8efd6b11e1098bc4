#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors for parsing identifiers and options from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown auth mode: {0}")]
	UnknownAuthMode(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Raw channel (chat room) name taken from routing context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
	/// Channel used when routing context does not carry one.
	pub const DEFAULT: &'static str = "channel-1";

	/// Create a non-empty `ChannelName`. Surrounding whitespace is trimmed.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed = name.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.len() == name.len() {
			Ok(Self(name))
		} else {
			Ok(Self(trimmed.to_string()))
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Default for ChannelName {
	fn default() -> Self {
		Self(Self::DEFAULT.to_string())
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s.to_string())
	}
}

/// Namespaced broker topic: `<prefix><separator><channel name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelIdentity(String);

impl ChannelIdentity {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ChannelIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Prefix and separator used to namespace channel names on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNamespace {
	pub prefix: String,
	pub separator: String,
}

impl ChannelNamespace {
	pub const DEFAULT_PREFIX: &'static str = "chatlette";
	pub const DEFAULT_SEPARATOR: &'static str = "/";

	pub fn new(prefix: impl Into<String>, separator: impl Into<String>) -> Self {
		Self {
			prefix: prefix.into(),
			separator: separator.into(),
		}
	}

	/// Compose the broker topic for `channel`.
	pub fn identity(&self, channel: &ChannelName) -> ChannelIdentity {
		ChannelIdentity(format!("{}{}{}", self.prefix, self.separator, channel.as_str()))
	}
}

impl Default for ChannelNamespace {
	fn default() -> Self {
		Self::new(Self::DEFAULT_PREFIX, Self::DEFAULT_SEPARATOR)
	}
}

/// Connect-time authorization requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
	/// Anonymous connections are rejected with a policy-violation close.
	#[default]
	RequireAuthenticated,
	/// Anonymous connections may listen but every inbound action is denied.
	AllowAnonymousRestricted,
	/// Anonymous connections have the same privileges as authenticated ones.
	AllowAnonymousFull,
}

impl AuthMode {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			AuthMode::RequireAuthenticated => "require-authenticated",
			AuthMode::AllowAnonymousRestricted => "allow-anonymous-restricted",
			AuthMode::AllowAnonymousFull => "allow-anonymous-full",
		}
	}
}

impl fmt::Display for AuthMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for AuthMode {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().replace('_', "-").as_str() {
			"require-authenticated" => Ok(AuthMode::RequireAuthenticated),
			"allow-anonymous-restricted" => Ok(AuthMode::AllowAnonymousRestricted),
			"allow-anonymous-full" => Ok(AuthMode::AllowAnonymousFull),
			other => Err(ParseIdError::UnknownAuthMode(other.to_string())),
		}
	}
}

/// Who is on the other end of a connection, as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Identity {
	Authenticated {
		username: String,
		display_name: Option<String>,
		/// Unix seconds after which the credentials are no longer valid.
		expires_at: Option<u64>,
	},
	#[default]
	Anonymous,
}

impl Identity {
	pub fn authenticated(username: impl Into<String>) -> Self {
		Identity::Authenticated {
			username: username.into(),
			display_name: None,
			expires_at: None,
		}
	}

	pub fn is_authenticated(&self) -> bool {
		matches!(self, Identity::Authenticated { .. })
	}

	pub fn username(&self) -> Option<&str> {
		match self {
			Identity::Authenticated { username, .. } => Some(username),
			Identity::Anonymous => None,
		}
	}

	/// Provider display name, falling back to the username.
	pub fn display_name(&self) -> Option<&str> {
		match self {
			Identity::Authenticated {
				username, display_name, ..
			} => Some(display_name.as_deref().filter(|n| !n.trim().is_empty()).unwrap_or(username)),
			Identity::Anonymous => None,
		}
	}

	/// Whether the credentials have expired at `now_unix_secs`.
	pub fn is_expired(&self, now_unix_secs: u64) -> bool {
		match self {
			Identity::Authenticated {
				expires_at: Some(exp), ..
			} => *exp <= now_unix_secs,
			_ => false,
		}
	}
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Identity::Authenticated { username, .. } => f.write_str(username),
			Identity::Anonymous => f.write_str("<anonymous>"),
		}
	}
}

/// Close status codes sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseStatus {
	Normal,
	GoingAway,
	PolicyViolation,
	InternalError,
}

impl CloseStatus {
	/// Numeric websocket close code.
	pub const fn code(self) -> u16 {
		match self {
			CloseStatus::Normal => 1000,
			CloseStatus::GoingAway => 1001,
			CloseStatus::PolicyViolation => 1008,
			CloseStatus::InternalError => 1011,
		}
	}

	pub const fn reason(self) -> &'static str {
		match self {
			CloseStatus::Normal => "bye",
			CloseStatus::GoingAway => "server shutting down",
			CloseStatus::PolicyViolation => "policy violation",
			CloseStatus::InternalError => "broker unavailable",
		}
	}
}

impl fmt::Display for CloseStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} ({})", self.code(), self.reason())
	}
}

/// Message unit exchanged with clients and over the broker.
///
/// Inbound messages carry `action` and `content`; the server adds `chatname`
/// before publishing. Unknown top-level fields are preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	#[serde(default)]
	pub action: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub chatname: Option<String>,

	#[serde(default)]
	pub content: Value,

	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl Envelope {
	/// Action tag used for server-originated error notices.
	pub const ERROR_ACTION: &'static str = "error";

	pub fn new(action: impl Into<String>, content: Value) -> Self {
		Self {
			action: action.into(),
			chatname: None,
			content,
			extra: Map::new(),
		}
	}

	pub fn with_chatname(mut self, chatname: impl Into<String>) -> Self {
		self.chatname = Some(chatname.into());
		self
	}

	/// Structured error notice: `{action: "error", content: {code, message}}`.
	pub fn error(code: &str, message: impl Into<String>) -> Self {
		let mut content = Map::new();
		content.insert("code".to_string(), Value::String(code.to_string()));
		content.insert("message".to_string(), Value::String(message.into()));
		Self::new(Self::ERROR_ACTION, Value::Object(content))
	}

	/// Look up a string field of an object `content`.
	pub fn content_str(&self, key: &str) -> Option<&str> {
		self.content.get(key).and_then(Value::as_str)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn channel_identity_uses_prefix_and_separator() {
		let ns = ChannelNamespace::default();
		let id = ns.identity(&ChannelName::default());
		assert_eq!(id.as_str(), "chatlette/channel-1");

		let ns = ChannelNamespace::new("chat", ":");
		let id = ns.identity(&"lobby".parse().unwrap());
		assert_eq!(id.to_string(), "chat:lobby");
	}

	#[test]
	fn rejects_empty_channel_names() {
		assert!(ChannelName::new("").is_err());
		assert!(ChannelName::new("   ").is_err());
		assert_eq!(ChannelName::new(" lobby ").unwrap().as_str(), "lobby");
	}

	#[test]
	fn auth_mode_parse_and_display() {
		assert_eq!(
			"require-authenticated".parse::<AuthMode>().unwrap(),
			AuthMode::RequireAuthenticated
		);
		assert_eq!(
			"ALLOW_ANONYMOUS_FULL".parse::<AuthMode>().unwrap(),
			AuthMode::AllowAnonymousFull
		);
		assert_eq!(AuthMode::AllowAnonymousRestricted.to_string(), "allow-anonymous-restricted");
		assert!(matches!(
			"whatever".parse::<AuthMode>(),
			Err(ParseIdError::UnknownAuthMode(_))
		));
	}

	#[test]
	fn identity_display_name_falls_back_to_username() {
		let alice = Identity::authenticated("alice");
		assert_eq!(alice.display_name(), Some("alice"));

		let bob = Identity::Authenticated {
			username: "bob".to_string(),
			display_name: Some("Bobby".to_string()),
			expires_at: Some(100),
		};
		assert_eq!(bob.display_name(), Some("Bobby"));
		assert!(!bob.is_expired(99));
		assert!(bob.is_expired(100));
		assert!(!Identity::Anonymous.is_expired(u64::MAX));
		assert_eq!(Identity::Anonymous.display_name(), None);
	}

	#[test]
	fn envelope_serializes_chatname_only_when_set() {
		let env = Envelope::new("send_message", json!({"text": "hi"}));
		assert_eq!(
			serde_json::to_value(&env).unwrap(),
			json!({"action": "send_message", "content": {"text": "hi"}})
		);

		let env = env.with_chatname("Alice");
		assert_eq!(
			serde_json::to_value(&env).unwrap(),
			json!({"action": "send_message", "chatname": "Alice", "content": {"text": "hi"}})
		);
	}

	#[test]
	fn envelope_preserves_unknown_fields() {
		let env: Envelope =
			serde_json::from_value(json!({"action": "x", "content": 1, "channel": "chatlette/lobby"})).unwrap();
		assert_eq!(env.extra.get("channel"), Some(&json!("chatlette/lobby")));
		assert_eq!(
			serde_json::to_value(&env).unwrap(),
			json!({"action": "x", "content": 1, "channel": "chatlette/lobby"})
		);
	}

	#[test]
	fn envelope_defaults_missing_fields() {
		let env: Envelope = serde_json::from_value(json!({})).unwrap();
		assert_eq!(env.action, "");
		assert_eq!(env.content, Value::Null);
		assert!(env.chatname.is_none());
	}
}
