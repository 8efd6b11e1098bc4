#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chatlette_domain::{AuthMode, ChannelName, ChannelNamespace};
use chatlette_protocol::DEFAULT_MAX_MESSAGE_SIZE;
use chatlette_util::secret::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.chatlette/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatlette").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub broker: BrokerSettings,
	pub channel: ChannelSettings,
	pub access: AccessSettings,
}

/// Listener and ambient settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Path prefix under which channels are routed, e.g. `/ws` for `/ws/<channel>`.
	pub route_base: String,
	/// Upper bound for a single encoded envelope.
	pub max_message_bytes: usize,
	/// HMAC secret for stateless access tokens. Without it every connection is anonymous.
	pub auth_hmac_secret: Option<SecretString>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			health_bind: None,
			route_base: "/ws".to_string(),
			max_message_bytes: DEFAULT_MAX_MESSAGE_SIZE,
			auth_hmac_secret: None,
		}
	}
}

/// Pub/sub broker settings.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
	/// `redis://...` or `memory://`.
	pub url: String,
}

impl Default for BrokerSettings {
	fn default() -> Self {
		Self {
			url: "redis://localhost".to_string(),
		}
	}
}

/// Channel identity composition.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
	pub namespace: ChannelNamespace,
	pub default_channel: ChannelName,
}

impl Default for ChannelSettings {
	fn default() -> Self {
		Self {
			namespace: ChannelNamespace::default(),
			default_channel: ChannelName::default(),
		}
	}
}

/// Authorization and client-notification policy.
#[derive(Debug, Clone)]
pub struct AccessSettings {
	pub mode: AuthMode,
	/// Display name used when neither an established name nor a provider name exists.
	pub guest_label: String,
	/// Require a `new_user` action before chat content is accepted.
	pub require_chatname: bool,
	/// Send `{action: "error"}` notices for dropped or unsupported actions.
	pub notify_client_errors: bool,
	/// How long teardown waits for the delivery loop before cancelling it.
	pub delivery_grace: Duration,
}

impl Default for AccessSettings {
	fn default() -> Self {
		Self {
			mode: AuthMode::default(),
			guest_label: "guest".to_string(),
			require_chatname: true,
			notify_client_errors: false,
			delivery_grace: Duration::from_millis(250),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	broker: FileBrokerSettings,

	#[serde(default)]
	channel: FileChannelSettings,

	#[serde(default)]
	access: FileAccessSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	route_base: Option<String>,
	max_message_bytes: Option<usize>,
	auth_hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBrokerSettings {
	url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChannelSettings {
	prefix: Option<String>,
	separator: Option<String>,
	default_channel: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAccessSettings {
	mode: Option<String>,
	guest_label: Option<String>,
	require_chatname: Option<bool>,
	notify_client_errors: Option<bool>,
	delivery_grace_ms: Option<u64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ServerConfig::default();

		let mode = match file.access.mode.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
			Some(raw) => raw.parse::<AuthMode>().with_context(|| format!("access.mode = {raw:?}"))?,
			None => defaults.access.mode,
		};

		let default_channel = match file.channel.default_channel.filter(|s| !s.trim().is_empty()) {
			Some(raw) => ChannelName::new(raw).context("channel.default_channel")?,
			None => defaults.channel.default_channel,
		};

		Ok(Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				route_base: file
					.server
					.route_base
					.filter(|s| !s.trim().is_empty())
					.map(|s| normalize_route_base(&s))
					.unwrap_or(defaults.server.route_base),
				max_message_bytes: file
					.server
					.max_message_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.server.max_message_bytes),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
			},
			broker: BrokerSettings {
				url: file
					.broker
					.url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.broker.url),
			},
			channel: ChannelSettings {
				namespace: ChannelNamespace::new(
					file.channel
						.prefix
						.unwrap_or_else(|| ChannelNamespace::DEFAULT_PREFIX.to_string()),
					file.channel
						.separator
						.unwrap_or_else(|| ChannelNamespace::DEFAULT_SEPARATOR.to_string()),
				),
				default_channel,
			},
			access: AccessSettings {
				mode,
				guest_label: file
					.access
					.guest_label
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.access.guest_label),
				require_chatname: file.access.require_chatname.unwrap_or(defaults.access.require_chatname),
				notify_client_errors: file
					.access
					.notify_client_errors
					.unwrap_or(defaults.access.notify_client_errors),
				delivery_grace: file
					.access
					.delivery_grace_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.access.delivery_grace),
			},
		})
	}
}

/// `ws/` and `/ws/` both become `/ws`; `/` stays `/`.
fn normalize_route_base(raw: &str) -> String {
	let trimmed = raw.trim().trim_matches('/');
	if trimmed.is_empty() {
		"/".to_string()
	} else {
		format!("/{trimmed}")
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("CHATLETTE_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("CHATLETTE_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = var("CHATLETTE_ROUTE_BASE") {
		cfg.server.route_base = normalize_route_base(&v);
		info!(route_base = %cfg.server.route_base, "server config: route_base overridden by env");
	}

	if let Some(v) = var("CHATLETTE_MAX_MESSAGE_BYTES") {
		match v.parse::<usize>() {
			Ok(max) if max > 0 => {
				cfg.server.max_message_bytes = max;
				info!(max, "server config: max_message_bytes overridden by env");
			}
			_ => warn!(value = %v, "server config: ignoring invalid CHATLETTE_MAX_MESSAGE_BYTES"),
		}
	}

	if let Some(v) = var("CHATLETTE_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = var("CHATLETTE_BROKER_URL") {
		cfg.broker.url = v;
		info!("broker config: url overridden by env");
	}

	if let Some(v) = env("CHATLETTE_CHANNEL_PREFIX") {
		cfg.channel.namespace.prefix = v;
		info!(prefix = %cfg.channel.namespace.prefix, "channel config: prefix overridden by env");
	}

	if let Some(v) = env("CHATLETTE_CHANNEL_SEPARATOR") {
		cfg.channel.namespace.separator = v;
		info!(separator = %cfg.channel.namespace.separator, "channel config: separator overridden by env");
	}

	if let Some(v) = var("CHATLETTE_DEFAULT_CHANNEL") {
		match ChannelName::new(v) {
			Ok(name) => {
				info!(default_channel = %name, "channel config: default_channel overridden by env");
				cfg.channel.default_channel = name;
			}
			Err(e) => warn!(error = %e, "channel config: ignoring invalid CHATLETTE_DEFAULT_CHANNEL"),
		}
	}

	if let Some(v) = var("CHATLETTE_AUTH_MODE") {
		match v.parse::<AuthMode>() {
			Ok(mode) => {
				cfg.access.mode = mode;
				info!(%mode, "access config: mode overridden by env");
			}
			Err(e) => warn!(error = %e, "access config: ignoring invalid CHATLETTE_AUTH_MODE"),
		}
	}

	if let Some(v) = var("CHATLETTE_GUEST_LABEL") {
		cfg.access.guest_label = v;
		info!("access config: guest_label overridden by env");
	}

	if let Some(v) = var("CHATLETTE_REQUIRE_CHATNAME")
		&& let Some(require) = parse_env_bool(&v)
	{
		cfg.access.require_chatname = require;
		info!(require, "access config: require_chatname overridden by env");
	}

	if let Some(v) = var("CHATLETTE_NOTIFY_CLIENT_ERRORS")
		&& let Some(notify) = parse_env_bool(&v)
	{
		cfg.access.notify_client_errors = notify;
		info!(notify, "access config: notify_client_errors overridden by env");
	}

	if let Some(v) = var("CHATLETTE_DELIVERY_GRACE_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.access.delivery_grace = Duration::from_millis(ms);
		info!(ms, "access config: delivery_grace overridden by env");
	}

	if cfg.server.auth_hmac_secret.is_none() && cfg.access.mode == AuthMode::RequireAuthenticated {
		warn!("access config: require-authenticated without auth_hmac_secret; every connection will be rejected");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> anyhow::Result<ServerConfig> {
		let file: FileConfig = toml::from_str(toml_src)?;
		ServerConfig::from_file(file)
	}

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = parse("").unwrap();
		assert_eq!(cfg.broker.url, "redis://localhost");
		assert_eq!(cfg.channel.namespace, ChannelNamespace::new("chatlette", "/"));
		assert_eq!(cfg.channel.default_channel.as_str(), "channel-1");
		assert_eq!(cfg.access.mode, AuthMode::RequireAuthenticated);
		assert_eq!(cfg.access.guest_label, "guest");
		assert!(cfg.access.require_chatname);
		assert!(!cfg.access.notify_client_errors);
		assert_eq!(cfg.server.route_base, "/ws");
	}

	#[test]
	fn file_values_are_normalized() {
		let cfg = parse(
			r#"
			[server]
			route_base = "chat/"
			max_message_bytes = 1024
			auth_hmac_secret = "  "

			[broker]
			url = "memory://"

			[channel]
			prefix = "rooms"
			separator = ":"
			default_channel = "lobby"

			[access]
			mode = "allow-anonymous-full"
			guest_label = "visitor"
			require_chatname = false
			notify_client_errors = true
			delivery_grace_ms = 10
			"#,
		)
		.unwrap();

		assert_eq!(cfg.server.route_base, "/chat");
		assert_eq!(cfg.server.max_message_bytes, 1024);
		assert!(cfg.server.auth_hmac_secret.is_none());
		assert_eq!(cfg.broker.url, "memory://");
		assert_eq!(cfg.channel.namespace.identity(&cfg.channel.default_channel).as_str(), "rooms:lobby");
		assert_eq!(cfg.access.mode, AuthMode::AllowAnonymousFull);
		assert_eq!(cfg.access.guest_label, "visitor");
		assert!(!cfg.access.require_chatname);
		assert!(cfg.access.notify_client_errors);
		assert_eq!(cfg.access.delivery_grace, Duration::from_millis(10));
	}

	#[test]
	fn unknown_auth_mode_is_a_config_error() {
		let err = parse("[access]\nmode = \"sometimes\"\n").unwrap_err();
		assert!(format!("{err:#}").contains("sometimes"));
	}

	#[test]
	fn env_overrides_apply_and_invalid_values_are_ignored() {
		let env: HashMap<&str, &str> = HashMap::from([
			("CHATLETTE_BROKER_URL", " redis://cache:6379 "),
			("CHATLETTE_AUTH_MODE", "allow-anonymous-restricted"),
			("CHATLETTE_REQUIRE_CHATNAME", "off"),
			("CHATLETTE_MAX_MESSAGE_BYTES", "zero"),
			("CHATLETTE_DEFAULT_CHANNEL", "   "),
			("CHATLETTE_ROUTE_BASE", "/"),
		]);

		let mut cfg = ServerConfig::default();
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.broker.url, "redis://cache:6379");
		assert_eq!(cfg.access.mode, AuthMode::AllowAnonymousRestricted);
		assert!(!cfg.access.require_chatname);
		assert_eq!(cfg.server.max_message_bytes, DEFAULT_MAX_MESSAGE_SIZE);
		assert_eq!(cfg.channel.default_channel.as_str(), "channel-1");
		assert_eq!(cfg.server.route_base, "/");
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let path = std::env::temp_dir().join("chatlette-config-does-not-exist.toml");
		assert!(read_toml_if_exists(&path).unwrap().is_none());
	}
}
