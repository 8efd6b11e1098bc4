#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chatlette_domain::{CloseStatus, Envelope};
use chatlette_protocol::CodecError;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::server::channel::RouteParams;

#[derive(Debug, Error)]
pub enum TransportError {
	#[error("invalid frame: {0}")]
	InvalidFrame(#[from] CodecError),

	#[error("connection closed")]
	Closed,

	#[error("transport error: {0}")]
	Io(String),
}

/// Outbound half of a client connection.
#[async_trait]
pub trait ClientSink: Send + 'static {
	async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError>;

	/// Send a close frame with `status` and release the sink.
	async fn close(&mut self, status: CloseStatus) -> Result<(), TransportError>;
}

/// Inbound half of a client connection.
#[async_trait]
pub trait ClientStream: Send + 'static {
	/// Next decoded envelope. `None` once the client has gone away.
	async fn recv(&mut self) -> Option<Result<Envelope, TransportError>>;
}

/// The sink is written by the delivery loop and the lifecycle controller.
pub type SharedSink = Arc<Mutex<Box<dyn ClientSink>>>;

pub fn shared_sink(sink: Box<dyn ClientSink>) -> SharedSink {
	Arc::new(Mutex::new(sink))
}

/// A client connection after the transport handshake.
pub struct AcceptedTransport {
	pub sink: Box<dyn ClientSink>,
	pub stream: Box<dyn ClientStream>,
	/// Bearer token presented during the handshake.
	pub token: Option<String>,
	pub route: RouteParams,
	pub remote: Option<SocketAddr>,
}

#[cfg(test)]
pub mod testing {
	use std::sync::Mutex as StdMutex;

	use tokio::sync::mpsc;

	use super::*;

	/// What the server side wrote to a test client.
	#[derive(Debug, Default)]
	pub struct Recorded {
		pub sent: Vec<Envelope>,
		pub closes: Vec<CloseStatus>,
	}

	/// Client end of an in-memory transport.
	pub struct TestClient {
		inbound: Option<mpsc::UnboundedSender<Result<Envelope, TransportError>>>,
		outbound: mpsc::UnboundedReceiver<Envelope>,
		recorded: Arc<StdMutex<Recorded>>,
	}

	impl TestClient {
		pub fn send(&self, envelope: Envelope) {
			if let Some(tx) = &self.inbound {
				let _ = tx.send(Ok(envelope));
			}
		}

		pub fn send_invalid(&self, err: TransportError) {
			if let Some(tx) = &self.inbound {
				let _ = tx.send(Err(err));
			}
		}

		/// Client closes its side.
		pub fn hang_up(&mut self) {
			self.inbound = None;
		}

		/// Stop reading deliveries while keeping the inbound side open.
		pub fn stop_reading(&mut self) {
			self.outbound.close();
		}

		pub async fn next(&mut self) -> Option<Envelope> {
			self.outbound.recv().await
		}

		pub fn closes(&self) -> Vec<CloseStatus> {
			self.recorded.lock().map(|r| r.closes.clone()).unwrap_or_default()
		}

		pub fn sent(&self) -> Vec<Envelope> {
			self.recorded.lock().map(|r| r.sent.clone()).unwrap_or_default()
		}
	}

	struct TestSink {
		outbound: mpsc::UnboundedSender<Envelope>,
		recorded: Arc<StdMutex<Recorded>>,
		closed: bool,
	}

	#[async_trait]
	impl ClientSink for TestSink {
		async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
			if self.closed {
				return Err(TransportError::Closed);
			}
			if let Ok(mut r) = self.recorded.lock() {
				r.sent.push(envelope.clone());
			}
			self.outbound.send(envelope.clone()).map_err(|_| TransportError::Closed)
		}

		async fn close(&mut self, status: CloseStatus) -> Result<(), TransportError> {
			if self.closed {
				return Err(TransportError::Closed);
			}
			self.closed = true;
			if let Ok(mut r) = self.recorded.lock() {
				r.closes.push(status);
			}
			Ok(())
		}
	}

	struct TestStream {
		inbound: mpsc::UnboundedReceiver<Result<Envelope, TransportError>>,
	}

	#[async_trait]
	impl ClientStream for TestStream {
		async fn recv(&mut self) -> Option<Result<Envelope, TransportError>> {
			self.inbound.recv().await
		}
	}

	/// Build an accepted transport wired to a `TestClient`.
	pub fn pair(token: Option<&str>, route: RouteParams) -> (AcceptedTransport, TestClient) {
		let (in_tx, in_rx) = mpsc::unbounded_channel();
		let (out_tx, out_rx) = mpsc::unbounded_channel();
		let recorded = Arc::new(StdMutex::new(Recorded::default()));

		let accepted = AcceptedTransport {
			sink: Box::new(TestSink {
				outbound: out_tx,
				recorded: recorded.clone(),
				closed: false,
			}),
			stream: Box::new(TestStream { inbound: in_rx }),
			token: token.map(str::to_string),
			route,
			remote: None,
		};

		let client = TestClient {
			inbound: Some(in_tx),
			outbound: out_rx,
			recorded,
		};

		(accepted, client)
	}
}
