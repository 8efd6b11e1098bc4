#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::server::memory_broker::MemoryBroker;
use crate::server::redis_broker::RedisBroker;

#[derive(Debug, Error)]
pub enum BrokerError {
	#[error("unsupported broker url: {0}")]
	UnsupportedUrl(String),

	#[error("broker connection closed")]
	Closed,

	#[error("connection already consumed by a subscription")]
	AlreadySubscribed,

	#[error("redis error: {0}")]
	Redis(#[from] redis::RedisError),
}

/// Factory for broker connections. One instance is shared by every client connection.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
	async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// A single logical connection to the broker.
///
/// A connection is used either for publishing or for one subscription, never both.
#[async_trait]
pub trait BrokerConnection: Send + 'static {
	async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), BrokerError>;

	/// Subscribe to `topic`. The returned stream ends once this connection is closed.
	async fn subscribe(&mut self, topic: &str) -> Result<Box<dyn BrokerSubscription>, BrokerError>;

	/// Release the connection. Calling it again is a no-op.
	async fn close(&mut self);
}

#[async_trait]
pub trait BrokerSubscription: Send + 'static {
	/// Next raw payload, or `None` once the subscription has ended.
	async fn next(&mut self) -> Option<String>;
}

/// Resolves once the close flag is raised or its sender is gone.
pub(crate) async fn close_signal(closed: &mut watch::Receiver<bool>) {
	while !*closed.borrow_and_update() {
		if closed.changed().await.is_err() {
			return;
		}
	}
}

/// Pick a broker implementation from the URL scheme.
pub fn connect_broker(url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
	let url = url.trim();
	let scheme = url.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase());

	match scheme.as_deref() {
		Some("memory") => Ok(Arc::new(MemoryBroker::new())),
		Some("redis" | "rediss" | "redis+unix" | "unix") => Ok(Arc::new(RedisBroker::open(url)?)),
		_ => Err(BrokerError::UnsupportedUrl(url.to_string())),
	}
}
