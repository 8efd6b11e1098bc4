#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::server::broker::{Broker, BrokerConnection, BrokerError, BrokerSubscription, close_signal};

/// Redis pub/sub broker. Every `connect` opens a dedicated connection.
#[derive(Debug, Clone)]
pub struct RedisBroker {
	client: redis::Client,
}

impl RedisBroker {
	/// Validate `url`. No connection is made until `connect`.
	pub fn open(url: &str) -> Result<Self, BrokerError> {
		let client = redis::Client::open(url)?;
		Ok(Self { client })
	}
}

#[async_trait]
impl Broker for RedisBroker {
	async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
		let conn = self.client.get_async_connection().await?;
		let (closed_tx, _) = watch::channel(false);
		Ok(Box::new(RedisConnection {
			conn: Some(conn),
			closed_tx,
		}))
	}
}

struct RedisConnection {
	/// Taken by `subscribe` (pub/sub mode) or dropped by `close`.
	conn: Option<redis::aio::Connection>,
	closed_tx: watch::Sender<bool>,
}

impl RedisConnection {
	fn is_closed(&self) -> bool {
		*self.closed_tx.borrow()
	}
}

#[async_trait]
impl BrokerConnection for RedisConnection {
	async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), BrokerError> {
		if self.is_closed() {
			return Err(BrokerError::Closed);
		}
		let conn = self.conn.as_mut().ok_or(BrokerError::AlreadySubscribed)?;

		redis::cmd("PUBLISH")
			.arg(topic)
			.arg(payload)
			.query_async::<_, ()>(conn)
			.await?;
		Ok(())
	}

	async fn subscribe(&mut self, topic: &str) -> Result<Box<dyn BrokerSubscription>, BrokerError> {
		if self.is_closed() {
			return Err(BrokerError::Closed);
		}
		let conn = self.conn.take().ok_or(BrokerError::AlreadySubscribed)?;

		let mut pubsub = conn.into_pubsub();
		pubsub.subscribe(topic).await?;
		debug!(topic, "redis broker: subscribed");

		Ok(Box::new(RedisSubscription {
			messages: pubsub.into_on_message().boxed(),
			closed: self.closed_tx.subscribe(),
		}))
	}

	async fn close(&mut self) {
		if self.closed_tx.send_replace(true) {
			return;
		}
		self.conn = None;
	}
}

struct RedisSubscription {
	messages: BoxStream<'static, redis::Msg>,
	closed: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerSubscription for RedisSubscription {
	async fn next(&mut self) -> Option<String> {
		loop {
			let msg = tokio::select! {
				biased;
				_ = close_signal(&mut self.closed) => return None,
				msg = self.messages.next() => msg?,
			};

			match msg.get_payload::<String>() {
				Ok(payload) => return Some(payload),
				Err(e) => warn!(error = %e, channel = msg.get_channel_name(), "redis broker: non-text payload dropped"),
			}
		}
	}
}
