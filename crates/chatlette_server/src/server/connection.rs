#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chatlette_domain::{CloseStatus, Envelope, Identity};
use chatlette_protocol::error_codes;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::server::auth::{IdentityProvider, unix_secs_now};
use crate::server::bridge::{BridgeError, BrokerBridge, DeliveryEnd};
use crate::server::broker::Broker;
use crate::server::channel::{ChannelResolver, RouteParams};
use crate::server::dispatch::{ActionContext, ActionError, Dispatcher};
use crate::server::policy::{AccessDecision, AccessPolicy, DenyReason, Session};
use crate::server::transport::{AcceptedTransport, ClientStream, SharedSink, TransportError, shared_sink};

/// Per-connection server settings. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub identity_provider: IdentityProvider,
	pub policy: AccessPolicy,
	pub resolver: ChannelResolver,
	pub dispatcher: Dispatcher,

	/// Send `{action: "error"}` notices to the offending client.
	pub notify_client_errors: bool,
	pub delivery_grace: Duration,
	pub max_message_bytes: usize,
}

impl ConnectionSettings {
	pub fn from_config(cfg: &ServerConfig) -> Self {
		Self {
			identity_provider: IdentityProvider::new(cfg.server.auth_hmac_secret.clone()),
			policy: AccessPolicy::from_settings(&cfg.access),
			resolver: ChannelResolver::new(cfg.channel.namespace.clone(), cfg.channel.default_channel.clone()),
			dispatcher: Dispatcher::with_standard_actions(),
			notify_client_errors: cfg.access.notify_client_errors,
			delivery_grace: cfg.access.delivery_grace,
			max_message_bytes: cfg.server.max_message_bytes,
		}
	}
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self::from_config(&ServerConfig::default())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Connecting,
	Authorizing,
	Active,
	Closing,
	Closed,
	Rejected,
}

impl ConnectionState {
	pub fn is_terminal(self) -> bool {
		matches!(self, ConnectionState::Closed | ConnectionState::Rejected)
	}
}

/// Drive one client connection from accept to close.
///
/// Flipping `shutdown` to `true` closes an active connection with `GoingAway`.
pub async fn handle_connection(
	conn_id: u64,
	accepted: AcceptedTransport,
	broker: Arc<dyn Broker>,
	settings: Arc<ConnectionSettings>,
	shutdown: watch::Receiver<bool>,
) -> ConnectionState {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("chatlette_server_active_connections").decrement(1.0);
		}
	}

	metrics::counter!("chatlette_server_connections_total").increment(1);
	metrics::gauge!("chatlette_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let mut conn = Connection::accept(conn_id, accepted, settings, shutdown);
	if !conn.authorize(broker.as_ref()).await {
		return conn.state();
	}

	let close = conn.run().await;
	conn.teardown(close).await;
	conn.state()
}

pub(crate) struct Connection {
	id: u64,
	state: ConnectionState,
	token: Option<String>,
	route: RouteParams,
	session: Session,
	sink: SharedSink,
	stream: Box<dyn ClientStream>,
	bridge: Option<BrokerBridge>,
	settings: Arc<ConnectionSettings>,
	shutdown: watch::Receiver<bool>,
}

impl Connection {
	pub(crate) fn accept(
		id: u64,
		accepted: AcceptedTransport,
		settings: Arc<ConnectionSettings>,
		shutdown: watch::Receiver<bool>,
	) -> Self {
		debug!(conn_id = id, remote = ?accepted.remote, "connection: accepted");
		Self {
			id,
			state: ConnectionState::Connecting,
			token: accepted.token,
			route: accepted.route,
			session: Session::default(),
			sink: shared_sink(accepted.sink),
			stream: accepted.stream,
			bridge: None,
			settings,
			shutdown,
		}
	}

	pub(crate) fn state(&self) -> ConnectionState {
		self.state
	}

	fn transition(&mut self, next: ConnectionState) {
		debug!(conn_id = self.id, from = ?self.state, to = ?next, "connection: state change");
		self.state = next;
	}

	/// Connect-time authorization, then channel resolution and broker setup.
	///
	/// Returns `true` once the connection is `Active`. On rejection no broker
	/// connection is ever opened.
	pub(crate) async fn authorize(&mut self, broker: &dyn Broker) -> bool {
		self.transition(ConnectionState::Authorizing);

		let identity = self.settings.identity_provider.identify(self.token.take().as_deref());
		self.session = Session::new(identity);

		if let AccessDecision::Deny(reason) = self.settings.policy.check_connect(&self.session.identity) {
			metrics::counter!("chatlette_server_connections_rejected_total").increment(1);
			warn!(conn_id = self.id, %reason, mode = %self.settings.policy.mode(), "connection: rejected");
			self.close_transport(CloseStatus::PolicyViolation).await;
			self.transition(ConnectionState::Rejected);
			return false;
		}

		let topic = self.settings.resolver.resolve(&self.route);
		match BrokerBridge::open(
			broker,
			self.id,
			topic.clone(),
			self.sink.clone(),
			self.settings.max_message_bytes,
		)
		.await
		{
			Ok(bridge) => self.bridge = Some(bridge),
			Err(e) => {
				metrics::counter!("chatlette_server_broker_errors_total").increment(1);
				warn!(conn_id = self.id, topic = %topic, error = %e, "connection: broker unavailable");
				self.transition(ConnectionState::Closing);
				self.close_transport(CloseStatus::InternalError).await;
				self.transition(ConnectionState::Closed);
				return false;
			}
		}

		info!(conn_id = self.id, topic = %topic, identity = %self.session.identity, "connection: active");
		self.transition(ConnectionState::Active);
		true
	}

	/// Inbound loop racing the delivery loop. Returns the close status to send, if any.
	pub(crate) async fn run(&mut self) -> Option<CloseStatus> {
		let expiry = self.expiry_deadline();

		loop {
			let Some(bridge) = self.bridge.as_mut() else {
				return Some(CloseStatus::InternalError);
			};

			tokio::select! {
				end = bridge.delivery_finished() => {
					return match end {
						DeliveryEnd::ClientGone => None,
						DeliveryEnd::SubscriptionEnded | DeliveryEnd::Aborted => {
							metrics::counter!("chatlette_server_broker_errors_total").increment(1);
							warn!(conn_id = self.id, ?end, "connection: broker subscription ended");
							Some(CloseStatus::InternalError)
						}
					};
				}
				_ = expiry_elapsed(expiry) => {
					warn!(conn_id = self.id, "connection: credentials expired");
					return Some(CloseStatus::PolicyViolation);
				}
				_ = shutdown_requested(&mut self.shutdown) => {
					debug!(conn_id = self.id, "connection: server shutting down");
					return Some(CloseStatus::GoingAway);
				}
				inbound = self.stream.recv() => match inbound {
					None => {
						debug!(conn_id = self.id, "connection: client disconnected");
						return Some(CloseStatus::Normal);
					}
					Some(Err(TransportError::InvalidFrame(e))) => {
						metrics::counter!("chatlette_server_invalid_frames_total").increment(1);
						warn!(conn_id = self.id, error = %e, "connection: invalid frame dropped");
						self.notify(error_codes::INVALID_FRAME, e.to_string()).await;
					}
					Some(Err(e)) => {
						debug!(conn_id = self.id, error = %e, "connection: transport closed");
						return None;
					}
					Some(Ok(envelope)) => {
						if let Some(close) = self.handle_inbound(envelope).await {
							return Some(close);
						}
					}
				},
			}
		}
	}

	async fn handle_inbound(&mut self, envelope: Envelope) -> Option<CloseStatus> {
		metrics::counter!("chatlette_server_envelopes_in_total").increment(1);

		if let AccessDecision::Deny(reason) = self.settings.policy.revalidate(&self.session.identity, unix_secs_now()) {
			warn!(conn_id = self.id, %reason, "connection: late authorization failure");
			return Some(CloseStatus::PolicyViolation);
		}

		let settings = self.settings.clone();
		let mut ctx = ActionContext {
			policy: &settings.policy,
			session: &mut self.session,
		};

		let outbound = match settings.dispatcher.dispatch(&mut ctx, envelope) {
			Ok(env) => env,
			Err(err) => {
				self.report_action_error(&err);
				self.notify(err.code(), err.to_string()).await;
				return None;
			}
		};

		let Some(bridge) = self.bridge.as_mut() else {
			return Some(CloseStatus::InternalError);
		};
		match bridge.publish(&outbound).await {
			Ok(()) => None,
			Err(BridgeError::Encode(e)) => {
				warn!(conn_id = self.id, action = %outbound.action, error = %e, "connection: envelope not published");
				self.notify(error_codes::INVALID_FRAME, e.to_string()).await;
				None
			}
			Err(BridgeError::Broker(e)) => {
				metrics::counter!("chatlette_server_broker_errors_total").increment(1);
				warn!(conn_id = self.id, error = %e, "connection: publish failed");
				Some(CloseStatus::InternalError)
			}
		}
	}

	fn report_action_error(&self, err: &ActionError) {
		match err {
			ActionError::Unsupported(action) => {
				metrics::counter!("chatlette_server_actions_unsupported_total").increment(1);
				warn!(conn_id = self.id, action = %action, "connection: unsupported action");
			}
			ActionError::Denied(DenyReason::IdentityNotEstablished) => {
				metrics::counter!("chatlette_server_actions_denied_total").increment(1);
				error!(conn_id = self.id, "connection: chat content before new_user dropped");
			}
			ActionError::Denied(reason) => {
				metrics::counter!("chatlette_server_actions_denied_total").increment(1);
				warn!(conn_id = self.id, %reason, "connection: action denied");
			}
		}
	}

	async fn notify(&mut self, code: &str, message: String) {
		if !self.settings.notify_client_errors {
			return;
		}
		if let Err(e) = self.sink.lock().await.send(&Envelope::error(code, message)).await {
			debug!(conn_id = self.id, error = %e, "connection: error notice not delivered");
		}
	}

	async fn close_transport(&mut self, status: CloseStatus) {
		if let Err(e) = self.sink.lock().await.close(status).await {
			debug!(conn_id = self.id, %status, error = %e, "connection: transport close failed");
		}
	}

	/// Release the broker connections and close the transport. Safe to call more than once.
	pub(crate) async fn teardown(&mut self, close: Option<CloseStatus>) {
		if self.state.is_terminal() {
			return;
		}
		self.transition(ConnectionState::Closing);

		if let Some(bridge) = self.bridge.as_mut() {
			bridge.close(self.settings.delivery_grace).await;
		}
		if let Some(status) = close {
			self.close_transport(status).await;
		}

		self.transition(ConnectionState::Closed);
		info!(conn_id = self.id, "connection: closed");
	}

	fn expiry_deadline(&self) -> Option<Instant> {
		let exp = match &self.session.identity {
			Identity::Authenticated {
				expires_at: Some(exp), ..
			} => *exp,
			_ => return None,
		};
		// Past the clock's range means no deadline in practice.
		Instant::now().checked_add(Duration::from_secs(exp.saturating_sub(unix_secs_now())))
	}
}

/// Resolves once shutdown is signalled. A dropped sender never signals.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
	let signalled = shutdown.wait_for(|stop| *stop).await.is_ok();
	if !signalled {
		std::future::pending::<()>().await;
	}
}

async fn expiry_elapsed(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}
