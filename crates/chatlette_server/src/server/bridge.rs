#![forbid(unsafe_code)]

use std::time::Duration;

use chatlette_domain::{ChannelIdentity, Envelope};
use chatlette_protocol::{CodecError, decode_envelope, encode_envelope};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::server::broker::{Broker, BrokerConnection, BrokerError, BrokerSubscription};
use crate::server::transport::SharedSink;

#[derive(Debug, Error)]
pub enum BridgeError {
	#[error("encode envelope: {0}")]
	Encode(#[from] CodecError),

	#[error(transparent)]
	Broker(#[from] BrokerError),
}

/// Why a delivery loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEnd {
	/// The subscription ended: the subscribe connection was closed or the broker went away.
	SubscriptionEnded,
	/// Forwarding to the client failed.
	ClientGone,
	/// The task was cancelled or panicked.
	Aborted,
}

/// One publish and one subscribe connection for a single client connection.
pub struct BrokerBridge {
	conn_id: u64,
	topic: ChannelIdentity,
	max_message_bytes: usize,
	publisher: Box<dyn BrokerConnection>,
	subscriber: Box<dyn BrokerConnection>,
	delivery: Option<JoinHandle<DeliveryEnd>>,
	closed: bool,
}

impl BrokerBridge {
	/// Open both connections, subscribe to `topic` and start relaying deliveries to `sink`.
	///
	/// Connections opened before a failure are closed again before the error is returned.
	pub async fn open(
		broker: &dyn Broker,
		conn_id: u64,
		topic: ChannelIdentity,
		sink: SharedSink,
		max_message_bytes: usize,
	) -> Result<Self, BrokerError> {
		let mut publisher = broker.connect().await?;

		let mut subscriber = match broker.connect().await {
			Ok(c) => c,
			Err(e) => {
				publisher.close().await;
				return Err(e);
			}
		};

		let subscription = match subscriber.subscribe(topic.as_str()).await {
			Ok(s) => s,
			Err(e) => {
				subscriber.close().await;
				publisher.close().await;
				return Err(e);
			}
		};

		metrics::counter!("chatlette_server_broker_connections_opened_total").increment(2);
		debug!(conn_id, topic = %topic, "bridge: subscribed");

		let delivery = tokio::spawn(run_delivery(conn_id, subscription, sink, max_message_bytes));

		Ok(Self {
			conn_id,
			topic,
			max_message_bytes,
			publisher,
			subscriber,
			delivery: Some(delivery),
			closed: false,
		})
	}

	pub async fn publish(&mut self, envelope: &Envelope) -> Result<(), BridgeError> {
		let payload = encode_envelope(envelope, self.max_message_bytes)?;
		self.publisher.publish(self.topic.as_str(), &payload).await?;
		metrics::counter!("chatlette_server_published_total").increment(1);
		Ok(())
	}

	/// Resolves when the delivery loop stops. Pending forever once it has been observed or cancelled.
	pub async fn delivery_finished(&mut self) -> DeliveryEnd {
		let Some(handle) = self.delivery.as_mut() else {
			return std::future::pending().await;
		};

		let end = handle.await.unwrap_or(DeliveryEnd::Aborted);
		self.delivery = None;
		end
	}

	/// Close both connections and stop the delivery loop. Safe to call more than once.
	///
	/// The loop gets `grace` to observe the closed subscription before it is aborted.
	pub async fn close(&mut self, grace: Duration) {
		if !self.closed {
			self.closed = true;
			self.subscriber.close().await;
			self.publisher.close().await;
			metrics::counter!("chatlette_server_broker_connections_closed_total").increment(2);
		}

		let Some(mut handle) = self.delivery.take() else {
			return;
		};

		match timeout(grace, &mut handle).await {
			Ok(end) => debug!(conn_id = self.conn_id, end = ?end.unwrap_or(DeliveryEnd::Aborted), "bridge: delivery loop stopped"),
			Err(_) => {
				handle.abort();
				debug!(conn_id = self.conn_id, "bridge: delivery loop aborted after grace period");
			}
		}
	}
}

async fn run_delivery(
	conn_id: u64,
	mut subscription: Box<dyn BrokerSubscription>,
	sink: SharedSink,
	max_message_bytes: usize,
) -> DeliveryEnd {
	while let Some(payload) = subscription.next().await {
		let envelope = match decode_envelope(&payload, max_message_bytes) {
			Ok(env) => env,
			Err(e) => {
				metrics::counter!("chatlette_server_delivery_decode_errors_total").increment(1);
				warn!(conn_id, error = %e, "delivery: dropping undecodable broker payload");
				continue;
			}
		};

		let sent = sink.lock().await.send(&envelope).await;
		if let Err(e) = sent {
			debug!(conn_id, error = %e, "delivery: client send failed");
			return DeliveryEnd::ClientGone;
		}
		metrics::counter!("chatlette_server_delivered_total").increment(1);
	}

	DeliveryEnd::SubscriptionEnded
}
