#![forbid(unsafe_code)]

use std::collections::HashMap;

use chatlette_domain::{ChannelIdentity, ChannelName, ChannelNamespace};

/// Key-value routing context captured at accept time.
pub type RouteParams = HashMap<String, String>;

/// Routing key holding the raw channel name.
pub const CHANNEL_PARAM: &str = "channel";

/// Derives the broker topic for a connection from its routing context.
#[derive(Debug, Clone)]
pub struct ChannelResolver {
	namespace: ChannelNamespace,
	default_channel: ChannelName,
}

impl ChannelResolver {
	pub fn new(namespace: ChannelNamespace, default_channel: ChannelName) -> Self {
		Self {
			namespace,
			default_channel,
		}
	}

	/// Channel named by the route, or the default when absent or blank.
	pub fn channel_name(&self, route: &RouteParams) -> ChannelName {
		route
			.get(CHANNEL_PARAM)
			.and_then(|raw| ChannelName::new(raw.as_str()).ok())
			.unwrap_or_else(|| self.default_channel.clone())
	}

	pub fn resolve(&self, route: &RouteParams) -> ChannelIdentity {
		self.namespace.identity(&self.channel_name(route))
	}
}

impl Default for ChannelResolver {
	fn default() -> Self {
		Self::new(ChannelNamespace::default(), ChannelName::default())
	}
}

/// Extract routing params from a request path under `route_base`.
///
/// `/ws` and `/ws/` carry no channel, `/ws/<channel>` names one and is
/// percent-decoded. Paths outside the base, with extra segments, or whose
/// channel does not decode to UTF-8 return `None`.
pub fn route_params_from_path(route_base: &str, path: &str) -> Option<RouteParams> {
	let base = route_base.trim_end_matches('/');
	let rest = if base.is_empty() {
		path
	} else {
		let rest = path.strip_prefix(base)?;
		if !(rest.is_empty() || rest.starts_with('/')) {
			return None;
		}
		rest
	};

	let mut segments = rest.split('/').filter(|s| !s.is_empty());
	let channel = segments.next();
	if segments.next().is_some() {
		return None;
	}

	let mut params = RouteParams::new();
	if let Some(channel) = channel {
		let channel = urlencoding::decode(channel).ok()?;
		params.insert(CHANNEL_PARAM.to_string(), channel.into_owned());
	}
	Some(params)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn route(channel: Option<&str>) -> RouteParams {
		channel
			.map(|c| RouteParams::from([(CHANNEL_PARAM.to_string(), c.to_string())]))
			.unwrap_or_default()
	}

	#[test]
	fn missing_channel_resolves_to_default() {
		let resolver = ChannelResolver::default();
		assert_eq!(resolver.resolve(&route(None)).as_str(), "chatlette/channel-1");
		assert_eq!(resolver.resolve(&route(Some("  "))).as_str(), "chatlette/channel-1");
	}

	#[test]
	fn same_route_always_resolves_to_same_identity() {
		let resolver = ChannelResolver::default();
		let a = resolver.resolve(&route(Some("lobby")));
		let b = resolver.resolve(&route(Some("lobby")));
		assert_eq!(a, b);
		assert_eq!(a.as_str(), "chatlette/lobby");
		assert_ne!(a, resolver.resolve(&route(Some("other"))));
	}

	#[test]
	fn custom_namespace_and_default() {
		let resolver = ChannelResolver::new(ChannelNamespace::new("rooms", "::"), ChannelName::new("main").unwrap());
		assert_eq!(resolver.resolve(&route(None)).as_str(), "rooms::main");
		assert_eq!(resolver.resolve(&route(Some("dev"))).as_str(), "rooms::dev");
	}

	#[test]
	fn unrelated_route_keys_are_ignored() {
		let resolver = ChannelResolver::default();
		let params = RouteParams::from([("room".to_string(), "lobby".to_string())]);
		assert_eq!(resolver.resolve(&params).as_str(), "chatlette/channel-1");
	}

	#[test]
	fn path_routing_under_base() {
		assert_eq!(route_params_from_path("/ws", "/ws"), Some(route(None)));
		assert_eq!(route_params_from_path("/ws", "/ws/"), Some(route(None)));
		assert_eq!(route_params_from_path("/ws", "/ws/lobby"), Some(route(Some("lobby"))));
		assert_eq!(route_params_from_path("/ws", "/ws/lobby/"), Some(route(Some("lobby"))));
		assert_eq!(route_params_from_path("/ws", "/wsx/lobby"), None);
		assert_eq!(route_params_from_path("/ws", "/other"), None);
		assert_eq!(route_params_from_path("/ws", "/ws/lobby/extra"), None);
	}

	#[test]
	fn encoded_channel_shares_topic_with_decoded_name() {
		let resolver = ChannelResolver::default();
		let encoded = route_params_from_path("/ws", "/ws/caf%C3%A9").unwrap();
		assert_eq!(encoded, route(Some("café")));
		assert_eq!(resolver.resolve(&encoded).as_str(), "chatlette/café");
		assert_eq!(route_params_from_path("/ws", "/ws/%FF"), None);
	}

	#[test]
	fn path_routing_at_root() {
		assert_eq!(route_params_from_path("/", "/"), Some(route(None)));
		assert_eq!(route_params_from_path("/", "/lobby"), Some(route(Some("lobby"))));
	}
}
