#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::debug;

use crate::server::broker::{Broker, BrokerConnection, BrokerError, BrokerSubscription, close_signal};

/// In-process pub/sub broker. Topics fan out to every live subscription.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
	inner: Arc<Mutex<Inner>>,
	stats: Arc<Stats>,
}

#[derive(Debug, Default)]
struct Inner {
	topics: HashMap<String, TopicEntry>,
	/// Remaining successful `connect` calls before connects start failing.
	connect_budget: Option<usize>,
}

#[derive(Debug, Default)]
struct TopicEntry {
	subscribers: Vec<mpsc::UnboundedSender<String>>,
}

#[derive(Debug, Default)]
struct Stats {
	opened: AtomicUsize,
	closed: AtomicUsize,
	published: AtomicUsize,
	down: AtomicBool,
}

impl MemoryBroker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Connections handed out so far.
	#[allow(dead_code)]
	pub fn connections_opened(&self) -> usize {
		self.stats.opened.load(Ordering::Relaxed)
	}

	/// Connections released through `close`.
	#[allow(dead_code)]
	pub fn connections_closed(&self) -> usize {
		self.stats.closed.load(Ordering::Relaxed)
	}

	#[allow(dead_code)]
	pub fn messages_published(&self) -> usize {
		self.stats.published.load(Ordering::Relaxed)
	}

	/// Live subscriptions on `topic`.
	#[allow(dead_code)]
	pub async fn subscriber_count(&self, topic: &str) -> usize {
		let inner = self.inner.lock().await;
		inner
			.topics
			.get(topic)
			.map(|entry| entry.subscribers.iter().filter(|s| !s.is_closed()).count())
			.unwrap_or(0)
	}

	/// Allow `n` more connects, then fail every further one.
	#[allow(dead_code)]
	pub async fn fail_connects_after(&self, n: usize) {
		self.inner.lock().await.connect_budget = Some(n);
	}

	/// Simulate losing the broker: every subscription ends and new operations fail.
	#[allow(dead_code)]
	pub async fn shut_down(&self) {
		self.stats.down.store(true, Ordering::Relaxed);
		let mut inner = self.inner.lock().await;
		inner.topics.clear();
		debug!("memory broker: shut down");
	}

	fn is_down(&self) -> bool {
		self.stats.down.load(Ordering::Relaxed)
	}

	async fn subscribe_topic(&self, topic: &str) -> mpsc::UnboundedReceiver<String> {
		let (tx, rx) = mpsc::unbounded_channel();

		let mut inner = self.inner.lock().await;
		let entry = inner.topics.entry(topic.to_string()).or_default();
		prune_closed_subscribers(entry);
		entry.subscribers.push(tx);

		debug!(topic, subs = entry.subscribers.len(), "memory broker: subscribed");
		rx
	}

	async fn publish_to_topic(&self, topic: &str, payload: &str) {
		self.stats.published.fetch_add(1, Ordering::Relaxed);

		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.topics.get_mut(topic) else {
			return;
		};

		for sub in &entry.subscribers {
			let _ = sub.send(payload.to_string());
		}

		prune_closed_subscribers(entry);
		if entry.subscribers.is_empty() {
			inner.topics.remove(topic);
		}
	}
}

#[async_trait]
impl Broker for MemoryBroker {
	async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
		if self.is_down() {
			return Err(BrokerError::Closed);
		}

		{
			let mut inner = self.inner.lock().await;
			if let Some(budget) = inner.connect_budget.as_mut() {
				if *budget == 0 {
					return Err(BrokerError::Closed);
				}
				*budget -= 1;
			}
		}

		self.stats.opened.fetch_add(1, Ordering::Relaxed);
		let (closed_tx, _) = watch::channel(false);
		Ok(Box::new(MemoryConnection {
			broker: self.clone(),
			closed_tx,
			subscribed: false,
		}))
	}
}

struct MemoryConnection {
	broker: MemoryBroker,
	closed_tx: watch::Sender<bool>,
	subscribed: bool,
}

impl MemoryConnection {
	fn is_closed(&self) -> bool {
		*self.closed_tx.borrow()
	}
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
	async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), BrokerError> {
		if self.is_closed() || self.broker.is_down() {
			return Err(BrokerError::Closed);
		}
		self.broker.publish_to_topic(topic, payload).await;
		Ok(())
	}

	async fn subscribe(&mut self, topic: &str) -> Result<Box<dyn BrokerSubscription>, BrokerError> {
		if self.is_closed() || self.broker.is_down() {
			return Err(BrokerError::Closed);
		}
		if self.subscribed {
			return Err(BrokerError::AlreadySubscribed);
		}
		self.subscribed = true;

		let rx = self.broker.subscribe_topic(topic).await;
		Ok(Box::new(MemorySubscription {
			rx,
			closed: self.closed_tx.subscribe(),
		}))
	}

	async fn close(&mut self) {
		if self.closed_tx.send_replace(true) {
			return;
		}
		self.broker.stats.closed.fetch_add(1, Ordering::Relaxed);
	}
}

struct MemorySubscription {
	rx: mpsc::UnboundedReceiver<String>,
	closed: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerSubscription for MemorySubscription {
	async fn next(&mut self) -> Option<String> {
		tokio::select! {
			biased;
			_ = close_signal(&mut self.closed) => None,
			msg = self.rx.recv() => msg,
		}
	}
}

fn prune_closed_subscribers(entry: &mut TopicEntry) {
	entry.subscribers.retain(|s| !s.is_closed());
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::time::timeout;

	use super::*;

	#[tokio::test]
	async fn publish_reaches_subscribers_of_that_topic_only() {
		let broker = MemoryBroker::new();
		let mut sub_conn = broker.connect().await.unwrap();
		let mut pub_conn = broker.connect().await.unwrap();

		let mut sub = sub_conn.subscribe("chatlette/a").await.unwrap();

		pub_conn.publish("chatlette/b", "b-1").await.unwrap();
		assert!(timeout(Duration::from_millis(50), sub.next()).await.is_err());

		pub_conn.publish("chatlette/a", "a-1").await.unwrap();
		let got = timeout(Duration::from_millis(250), sub.next()).await.unwrap();
		assert_eq!(got.as_deref(), Some("a-1"));
	}

	#[tokio::test]
	async fn close_ends_subscription_and_is_idempotent() {
		let broker = MemoryBroker::new();
		let mut conn = broker.connect().await.unwrap();
		let mut sub = conn.subscribe("t").await.unwrap();
		assert_eq!(broker.subscriber_count("t").await, 1);

		conn.close().await;
		conn.close().await;

		let got = timeout(Duration::from_millis(250), sub.next()).await.unwrap();
		assert_eq!(got, None);
		assert_eq!(broker.connections_opened(), 1);
		assert_eq!(broker.connections_closed(), 1);

		drop(sub);
		assert_eq!(broker.subscriber_count("t").await, 0);
		assert!(matches!(conn.publish("t", "x").await, Err(BrokerError::Closed)));
	}

	#[tokio::test]
	async fn a_connection_subscribes_once() {
		let broker = MemoryBroker::new();
		let mut conn = broker.connect().await.unwrap();
		let _sub = conn.subscribe("t").await.unwrap();
		assert!(matches!(conn.subscribe("t").await, Err(BrokerError::AlreadySubscribed)));
	}

	#[tokio::test]
	async fn shut_down_ends_subscriptions_and_refuses_connects() {
		let broker = MemoryBroker::new();
		let mut conn = broker.connect().await.unwrap();
		let mut sub = conn.subscribe("t").await.unwrap();

		broker.shut_down().await;

		let got = timeout(Duration::from_millis(250), sub.next()).await.unwrap();
		assert_eq!(got, None);
		assert!(broker.connect().await.is_err());
	}

	#[tokio::test]
	async fn connect_budget_limits_connections() {
		let broker = MemoryBroker::new();
		broker.fail_connects_after(1).await;
		assert!(broker.connect().await.is_ok());
		assert!(broker.connect().await.is_err());
		assert_eq!(broker.connections_opened(), 1);
	}
}
