#![forbid(unsafe_code)]

use std::fmt;

use chatlette_domain::{AuthMode, Identity};
use chatlette_protocol::error_codes;

use crate::config::AccessSettings;

/// Per-connection identity state consulted by the policy.
#[derive(Debug, Clone, Default)]
pub struct Session {
	pub identity: Identity,
	/// Display name set by a `new_user` action.
	pub chatname: Option<String>,
}

impl Session {
	pub fn new(identity: Identity) -> Self {
		Self {
			identity,
			chatname: None,
		}
	}
}

/// Why a connection or action was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
	/// Connect-time: the mode requires an authenticated identity.
	Unauthenticated,
	/// Late: the identity's credentials expired while connected.
	CredentialsExpired,
	/// Action-time: anonymous connections may only listen.
	AnonymousReadOnly,
	/// Action-time: chat content before `new_user`.
	IdentityNotEstablished,
}

impl DenyReason {
	/// Code used in client error notices.
	pub const fn code(self) -> &'static str {
		match self {
			DenyReason::IdentityNotEstablished => error_codes::IDENTITY_NOT_ESTABLISHED,
			DenyReason::Unauthenticated | DenyReason::CredentialsExpired | DenyReason::AnonymousReadOnly => {
				error_codes::ACTION_NOT_PERMITTED
			}
		}
	}
}

impl fmt::Display for DenyReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Unauthenticated => f.write_str("authentication required"),
			Self::CredentialsExpired => f.write_str("credentials expired"),
			Self::AnonymousReadOnly => f.write_str("anonymous connections are read-only"),
			Self::IdentityNotEstablished => f.write_str("display name not established; send new_user first"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
	Permit,
	Deny(DenyReason),
}

impl AccessDecision {
	#[allow(dead_code)]
	pub fn is_permit(self) -> bool {
		matches!(self, AccessDecision::Permit)
	}
}

/// Gates connection establishment and individual actions. Immutable once built.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
	mode: AuthMode,
	guest_label: String,
	require_chatname: bool,
}

impl AccessPolicy {
	pub fn new(mode: AuthMode, guest_label: impl Into<String>, require_chatname: bool) -> Self {
		Self {
			mode,
			guest_label: guest_label.into(),
			require_chatname,
		}
	}

	pub fn from_settings(settings: &AccessSettings) -> Self {
		Self::new(settings.mode, settings.guest_label.clone(), settings.require_chatname)
	}

	pub fn mode(&self) -> AuthMode {
		self.mode
	}

	pub fn check_connect(&self, identity: &Identity) -> AccessDecision {
		match (self.mode, identity.is_authenticated()) {
			(_, true) => AccessDecision::Permit,
			(AuthMode::RequireAuthenticated, false) => AccessDecision::Deny(DenyReason::Unauthenticated),
			(AuthMode::AllowAnonymousRestricted | AuthMode::AllowAnonymousFull, false) => AccessDecision::Permit,
		}
	}

	/// Re-check an already admitted identity; expired credentials force a close.
	pub fn revalidate(&self, identity: &Identity, now_unix_secs: u64) -> AccessDecision {
		if identity.is_expired(now_unix_secs) {
			AccessDecision::Deny(DenyReason::CredentialsExpired)
		} else {
			AccessDecision::Permit
		}
	}

	pub fn check_action(&self, session: &Session, requires_chatname: bool) -> AccessDecision {
		if !session.identity.is_authenticated() && self.mode == AuthMode::AllowAnonymousRestricted {
			return AccessDecision::Deny(DenyReason::AnonymousReadOnly);
		}

		if requires_chatname && self.require_chatname && session.chatname.is_none() {
			return AccessDecision::Deny(DenyReason::IdentityNotEstablished);
		}

		AccessDecision::Permit
	}

	/// Established name, else provider display name (or username), else the guest label.
	pub fn effective_display_name(&self, session: &Session) -> String {
		session
			.chatname
			.as_deref()
			.or_else(|| session.identity.display_name())
			.unwrap_or(&self.guest_label)
			.to_string()
	}

	/// Name to establish for a `new_user` request; blank requests fall back to the effective name.
	pub fn resolve_chatname(&self, session: &Session, requested: Option<&str>) -> String {
		match requested.map(str::trim).filter(|n| !n.is_empty()) {
			Some(name) => name.to_string(),
			None => self.effective_display_name(session),
		}
	}
}

impl Default for AccessPolicy {
	fn default() -> Self {
		Self::from_settings(&AccessSettings::default())
	}
}
