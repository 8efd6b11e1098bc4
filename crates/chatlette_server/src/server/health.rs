#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, header};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

/// Readiness flag and live connection count reported by the health endpoints.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	connections: Arc<AtomicUsize>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	pub fn connections(&self) -> usize {
		self.connections.load(Ordering::Relaxed)
	}

	/// Count a connection until the returned guard is dropped.
	pub fn track_connection(&self) -> ConnectionTracker {
		self.connections.fetch_add(1, Ordering::Relaxed);
		ConnectionTracker {
			connections: self.connections.clone(),
		}
	}
}

pub struct ConnectionTracker {
	connections: Arc<AtomicUsize>,
}

impl Drop for ConnectionTracker {
	fn drop(&mut self) {
		self.connections.fetch_sub(1, Ordering::Relaxed);
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route(req.method(), req.uri().path(), &state))
}

fn route(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, None, Bytes::new());
	}

	match path {
		"/healthz" => respond(StatusCode::OK, None, Bytes::from_static(b"ok")),
		"/readyz" => {
			let ready = state.is_ready();
			let body = serde_json::json!({ "ready": ready, "connections": state.connections() }).to_string();
			let status = if ready {
				StatusCode::OK
			} else {
				StatusCode::SERVICE_UNAVAILABLE
			};
			respond(status, Some("application/json"), Bytes::from(body))
		}
		_ => respond(StatusCode::NOT_FOUND, None, Bytes::new()),
	}
}

fn respond(status: StatusCode, content_type: Option<&'static str>, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	if let Some(ct) = content_type {
		resp.headers_mut()
			.insert(header::CONTENT_TYPE, header::HeaderValue::from_static(ct));
	}
	resp
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt;

	use super::*;

	async fn body_string(resp: Response<Full<Bytes>>) -> String {
		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		String::from_utf8(bytes.to_vec()).unwrap()
	}

	#[tokio::test]
	async fn readyz_reports_readiness_and_connections() {
		let state = HealthState::new();
		let resp = route(&Method::GET, "/readyz", &state);
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

		state.mark_ready();
		let _a = state.track_connection();
		{
			let _b = state.track_connection();
			assert_eq!(state.connections(), 2);
		}

		let resp = route(&Method::GET, "/readyz", &state);
		assert_eq!(resp.status(), StatusCode::OK);
		let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
		assert_eq!(body, serde_json::json!({"ready": true, "connections": 1}));
	}

	#[tokio::test]
	async fn healthz_and_unknown_paths() {
		let state = HealthState::new();
		let resp = route(&Method::GET, "/healthz", &state);
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(body_string(resp).await, "ok");

		assert_eq!(route(&Method::GET, "/nope", &state).status(), StatusCode::NOT_FOUND);
		assert_eq!(route(&Method::POST, "/healthz", &state).status(), StatusCode::METHOD_NOT_ALLOWED);
	}
}
