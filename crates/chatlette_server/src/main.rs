#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chatlette_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::auth::{AuthClaims, expiry_after, issue_hmac_token};
use crate::server::broker::connect_broker;
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::ws::accept_websocket;

const DEFAULT_BIND: &str = "ws://127.0.0.1:8000";
const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatlette_server [--bind ws://host:port] [--config path]\n\
\x20      chatlette_server --issue-token <username> [--name <display name>] [--ttl <secs>]\n\
\n\
Options:\n\
\t--bind         Bind endpoint (default: {DEFAULT_BIND})\n\
\t              Format: ws://host:port\n\
\t--config       Config file (default: ~/.chatlette/config.toml)\n\
\t--issue-token  Print an access token for <username> signed with the configured secret\n\
\t--name         Display name carried by the issued token\n\
\t--ttl          Token lifetime in seconds (default: {DEFAULT_TOKEN_TTL_SECS})\n\
\t--help         Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: SocketAddr,
	config_path: Option<PathBuf>,
	issue_token: Option<TokenRequest>,
}

struct TokenRequest {
	username: String,
	display_name: Option<String>,
	ttl_secs: u64,
}

fn parse_args() -> Args {
	let mut bind_endpoint = DEFAULT_BIND.to_string();
	let mut config_path = None;
	let mut token_user: Option<String> = None;
	let mut token_name = None;
	let mut ttl_secs = DEFAULT_TOKEN_TTL_SECS;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		let mut value = || it.next().filter(|v| !v.trim().is_empty()).unwrap_or_else(|| usage_and_exit());
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => bind_endpoint = value(),
			"--config" => config_path = Some(PathBuf::from(value())),
			"--issue-token" => token_user = Some(value()),
			"--name" => token_name = Some(value()),
			"--ttl" => {
				ttl_secs = value().parse().unwrap_or_else(|e| {
					eprintln!("--ttl: {e}");
					usage_and_exit();
				})
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = WsEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let bind: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args {
		bind,
		config_path,
		issue_token: token_user.map(|username| TokenRequest {
			username,
			display_name: token_name,
			ttl_secs,
		}),
	}
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatlette_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("chatlette_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Broker URLs may embed credentials; only the scheme is logged.
fn broker_scheme(url: &str) -> &str {
	url.split_once("://").map(|(scheme, _)| scheme).unwrap_or("?")
}

fn print_token(cfg: &config::ServerConfig, req: TokenRequest) -> anyhow::Result<()> {
	let secret = cfg
		.server
		.auth_hmac_secret
		.as_ref()
		.ok_or_else(|| anyhow!("no auth_hmac_secret configured (set server.auth_hmac_secret or CHATLETTE_AUTH_HMAC_SECRET)"))?;

	let exp = expiry_after(req.ttl_secs).ok_or_else(|| anyhow!("--ttl {} is out of range", req.ttl_secs))?;
	let claims = AuthClaims {
		sub: req.username,
		name: req.display_name,
		exp,
	};
	println!("{}", issue_hmac_token(&claims, secret.expose())?);
	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(req) = args.issue_token {
		return print_token(&server_cfg, req);
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let broker = connect_broker(&server_cfg.broker.url).context("configure broker")?;
	let conn_settings = Arc::new(ConnectionSettings::from_config(&server_cfg));
	let route_base: Arc<str> = Arc::from(server_cfg.server.route_base.as_str());
	let max_message_bytes = server_cfg.server.max_message_bytes;

	let listener = TcpListener::bind(args.bind)
		.await
		.with_context(|| format!("bind {}", args.bind))?;
	info!(
		bind = %args.bind,
		route_base = %route_base,
		broker = broker_scheme(&server_cfg.broker.url),
		mode = %server_cfg.access.mode,
		"chatlette_server: websocket endpoint ready"
	);

	health_state.mark_ready();

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let mut connections = JoinSet::new();
	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = tokio::select! {
			Some(_) = connections.join_next(), if !connections.is_empty() => continue,
			accepted = listener.accept() => match accepted {
				Ok(v) => v,
				Err(e) => {
					warn!(error = %e, "accept failed");
					continue;
				}
			},
			_ = tokio::signal::ctrl_c() => {
				info!("shutdown requested");
				break;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;

		let broker = Arc::clone(&broker);
		let conn_settings = Arc::clone(&conn_settings);
		let route_base = Arc::clone(&route_base);
		let tracker = health_state.track_connection();
		let shutdown = shutdown_rx.clone();

		connections.spawn(async move {
			let _tracker = tracker;
			let accepted = match accept_websocket(stream, remote, &route_base, max_message_bytes).await {
				Ok(accepted) => accepted,
				Err(e) => {
					debug!(conn_id, %remote, error = %e, "handshake failed");
					return;
				}
			};

			let state = handle_connection(conn_id, accepted, broker, conn_settings, shutdown).await;
			debug!(conn_id, ?state, "connection finished");
		});
	}

	health_state.mark_not_ready();
	drop(listener);
	shutdown_tx.send_replace(true);

	let in_flight = connections.len();
	info!(in_flight, "closing connections");
	let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
		while connections.join_next().await.is_some() {}
	})
	.await;
	if drained.is_err() {
		warn!(remaining = connections.len(), "shutdown grace elapsed, aborting connections");
		connections.shutdown().await;
	}

	info!("chatlette_server: stopped");
	Ok(())
}
