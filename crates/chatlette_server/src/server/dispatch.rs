#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use chatlette_domain::Envelope;
use chatlette_protocol::{actions, error_codes};
use thiserror::Error;

use crate::server::policy::{AccessDecision, AccessPolicy, DenyReason, Session};

/// State a handler may read and update while processing one inbound envelope.
pub struct ActionContext<'a> {
	pub policy: &'a AccessPolicy,
	pub session: &'a mut Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
	#[error("unsupported action: {0:?}")]
	Unsupported(String),

	#[error("action denied: {0}")]
	Denied(DenyReason),
}

impl ActionError {
	pub fn code(&self) -> &'static str {
		match self {
			ActionError::Unsupported(_) => error_codes::UNSUPPORTED_ACTION,
			ActionError::Denied(reason) => reason.code(),
		}
	}
}

/// Turns an inbound envelope into the envelope to publish.
pub type ActionHandler = fn(&mut ActionContext<'_>, Envelope) -> Result<Envelope, ActionError>;

#[derive(Clone, Copy)]
pub struct ActionEntry {
	pub handler: ActionHandler,
	/// Whether an established display name is needed first.
	pub requires_identity: bool,
}

/// Routes envelopes to handlers by their `action` tag.
#[derive(Clone, Default)]
pub struct Dispatcher {
	handlers: HashMap<String, ActionEntry>,
}

impl fmt::Debug for Dispatcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut actions: Vec<_> = self.handlers.keys().collect();
		actions.sort();
		f.debug_struct("Dispatcher").field("actions", &actions).finish()
	}
}

impl Dispatcher {
	pub fn new() -> Self {
		Self::default()
	}

	/// Dispatcher with `new_user` and `send_message`.
	pub fn with_standard_actions() -> Self {
		let mut d = Self::new();
		d.register(actions::NEW_USER, handle_new_user, false);
		d.register(actions::SEND_MESSAGE, handle_send_message, true);
		d
	}

	/// Register `handler` for `action`, replacing any previous one.
	pub fn register(&mut self, action: impl Into<String>, handler: ActionHandler, requires_identity: bool) {
		self.handlers.insert(
			action.into(),
			ActionEntry {
				handler,
				requires_identity,
			},
		);
	}

	#[allow(dead_code)]
	pub fn supports(&self, action: &str) -> bool {
		self.handlers.contains_key(action)
	}

	/// Gate the envelope through the policy, then run its handler.
	pub fn dispatch(&self, ctx: &mut ActionContext<'_>, envelope: Envelope) -> Result<Envelope, ActionError> {
		let Some(entry) = self.handlers.get(envelope.action.as_str()) else {
			return Err(ActionError::Unsupported(envelope.action));
		};

		if let AccessDecision::Deny(reason) = ctx.policy.check_action(ctx.session, entry.requires_identity) {
			return Err(ActionError::Denied(reason));
		}

		(entry.handler)(ctx, envelope)
	}
}

/// Establish the display name and announce it.
fn handle_new_user(ctx: &mut ActionContext<'_>, envelope: Envelope) -> Result<Envelope, ActionError> {
	let requested = envelope.content_str("chatname").or(envelope.chatname.as_deref());
	let chatname = ctx.policy.resolve_chatname(ctx.session, requested);
	ctx.session.chatname = Some(chatname.clone());

	Ok(Envelope::new(actions::NEW_USER, envelope.content).with_chatname(chatname))
}

fn handle_send_message(ctx: &mut ActionContext<'_>, envelope: Envelope) -> Result<Envelope, ActionError> {
	let chatname = ctx.policy.effective_display_name(ctx.session);
	Ok(Envelope::new(actions::SEND_MESSAGE, envelope.content).with_chatname(chatname))
}
