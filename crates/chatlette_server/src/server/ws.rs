#![forbid(unsafe_code)]

use std::net::SocketAddr;

use anyhow::Context as _;
use async_trait::async_trait;
use chatlette_domain::{CloseStatus, Envelope};
use chatlette_protocol::{decode_envelope, decode_envelope_bytes, encode_envelope};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, header};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::server::channel::{RouteParams, route_params_from_path};
use crate::server::transport::{AcceptedTransport, ClientSink, ClientStream, TransportError};

type Ws = WebSocketStream<TcpStream>;

/// Perform the websocket upgrade for `stream`.
///
/// The request path must sit under `route_base`; anything else is refused with 404.
/// A bearer token is taken from the `Authorization` header or the `token` query parameter.
pub async fn accept_websocket(
	stream: TcpStream,
	remote: SocketAddr,
	route_base: &str,
	max_message_bytes: usize,
) -> anyhow::Result<AcceptedTransport> {
	let mut route: Option<RouteParams> = None;
	let mut token: Option<String> = None;

	let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
		let Some(params) = route_params_from_path(route_base, req.uri().path()) else {
			let mut err = ErrorResponse::new(Some("unknown route".to_string()));
			*err.status_mut() = StatusCode::NOT_FOUND;
			return Err(err);
		};
		route = Some(params);
		token = bearer_token(req);
		Ok(resp)
	};

	let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
		.await
		.with_context(|| format!("websocket handshake with {remote}"))?;

	let (sink, stream) = ws.split();
	Ok(AcceptedTransport {
		sink: Box::new(WsSink {
			inner: sink,
			max_message_bytes,
			closed: false,
		}),
		stream: Box::new(WsStream {
			inner: stream,
			max_message_bytes,
		}),
		token,
		route: route.unwrap_or_default(),
		remote: Some(remote),
	})
}

fn bearer_token(req: &Request) -> Option<String> {
	let from_header = req
		.headers()
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.map(str::trim)
		.filter(|t| !t.is_empty());

	if let Some(t) = from_header {
		return Some(t.to_string());
	}

	token_from_query(req.uri().query()?)
}

fn token_from_query(query: &str) -> Option<String> {
	query
		.split('&')
		.filter_map(|pair| pair.split_once('='))
		.find(|(k, _)| *k == "token")
		.and_then(|(_, v)| urlencoding::decode(v).ok())
		.map(|v| v.into_owned())
		.filter(|v| !v.is_empty())
}

struct WsSink {
	inner: SplitSink<Ws, Message>,
	max_message_bytes: usize,
	closed: bool,
}

#[async_trait]
impl ClientSink for WsSink {
	async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
		if self.closed {
			return Err(TransportError::Closed);
		}
		let text = encode_envelope(envelope, self.max_message_bytes)?;
		self.inner
			.send(Message::Text(text.into()))
			.await
			.map_err(|e| TransportError::Io(e.to_string()))
	}

	async fn close(&mut self, status: CloseStatus) -> Result<(), TransportError> {
		if self.closed {
			return Err(TransportError::Closed);
		}
		self.closed = true;

		let frame = CloseFrame {
			code: CloseCode::from(status.code()),
			reason: status.reason().into(),
		};
		let sent = self.inner.send(Message::Close(Some(frame))).await;
		let _ = self.inner.close().await;
		sent.map_err(|e| TransportError::Io(e.to_string()))
	}
}

struct WsStream {
	inner: SplitStream<Ws>,
	max_message_bytes: usize,
}

#[async_trait]
impl ClientStream for WsStream {
	async fn recv(&mut self) -> Option<Result<Envelope, TransportError>> {
		loop {
			let msg = match self.inner.next().await? {
				Ok(msg) => msg,
				Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
			};

			match msg {
				Message::Text(text) => {
					return Some(decode_envelope(text.as_str(), self.max_message_bytes).map_err(Into::into));
				}
				Message::Binary(bytes) => {
					return Some(decode_envelope_bytes(&bytes, self.max_message_bytes).map_err(Into::into));
				}
				Message::Close(_) => return None,
				Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request(uri: &str, auth: Option<&str>) -> Request {
		let mut builder = Request::builder().uri(uri);
		if let Some(auth) = auth {
			builder = builder.header(header::AUTHORIZATION, auth);
		}
		builder.body(()).unwrap()
	}

	#[test]
	fn token_from_header_wins_over_query() {
		let req = request("/ws/lobby?token=from-query", Some("Bearer from-header"));
		assert_eq!(bearer_token(&req).as_deref(), Some("from-header"));
	}

	#[test]
	fn token_from_query_param() {
		let req = request("/ws/lobby?x=1&token=v1.abc.def", None);
		assert_eq!(bearer_token(&req).as_deref(), Some("v1.abc.def"));

		let req = request("/ws/lobby?token=", None);
		assert_eq!(bearer_token(&req), None);
	}

	#[test]
	fn non_bearer_authorization_is_ignored() {
		let req = request("/ws", Some("Basic dXNlcjpwYXNz"));
		assert_eq!(bearer_token(&req), None);
	}
}
