#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::registry::SubscriptionRegistry;

/// Readiness flag plus a view of the registry for `/readyz`.
#[derive(Clone, Debug, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	registry: Option<Arc<SubscriptionRegistry>>,
}

impl HealthState {
	pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			registry: Some(registry),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	fn channel_count(&self) -> usize {
		self.registry.as_ref().map(|r| r.channel_count()).unwrap_or(0)
	}
}

/// Bind `/healthz` and `/readyz` on `bind` and serve them in the background.
pub async fn spawn_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<SocketAddr> {
	let listener = TcpListener::bind(bind).await?;
	let local = listener.local_addr()?;
	tokio::spawn(async move {
		if let Err(err) = run_health_server(listener, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
	Ok(local)
}

async fn run_health_server(listener: TcpListener, state: HealthState) -> anyhow::Result<()> {
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

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route(req.method(), req.uri().path(), &state))
}

fn route(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	match path {
		"/healthz" => respond(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" if state.is_ready() => respond(
			StatusCode::OK,
			format!("ready channels={}", state.channel_count()),
		),
		"/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")),
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn readyz_flips_after_mark_ready() {
		let state = HealthState::new(Arc::new(SubscriptionRegistry::new()));

		let before = route(&Method::GET, "/readyz", &state);
		assert_eq!(before.status(), StatusCode::SERVICE_UNAVAILABLE);

		state.mark_ready();
		let after = route(&Method::GET, "/readyz", &state);
		assert_eq!(after.status(), StatusCode::OK);
	}

	#[test]
	fn only_get_on_known_paths() {
		let state = HealthState::default();
		assert_eq!(route(&Method::GET, "/healthz", &state).status(), StatusCode::OK);
		assert_eq!(route(&Method::POST, "/healthz", &state).status(), StatusCode::METHOD_NOT_ALLOWED);
		assert_eq!(route(&Method::GET, "/metrics", &state).status(), StatusCode::NOT_FOUND);
	}
}
