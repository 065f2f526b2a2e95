#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use shadow_relay::config::{ServerConfig, default_config_path, load_server_config_from_path};
use shadow_relay::quic::config::RelayQuicConfig;
use shadow_relay::server::health::{HealthState, spawn_health_server};
use shadow_relay::util::time::system_clock;
use shadow_relay::{AuthorizationGate, ConnectionSettings, GateConfig, RelayContext, serve};
use shadow_util::RelayEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: shadow_relay [--bind quic://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: quic://127.0.0.1:18203)\n\
\t         Format: quic://host:port\n\
\t--help   Show this help\n\
\n\
Credentials come from ~/.shadow/relay.toml and SHADOW_* environment variables.\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "quic://127.0.0.1:18203".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = RelayEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.resolve().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,shadow_relay=debug".to_string());

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
				let tracer = tracer_provider.tracer("shadow_relay");
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

fn build_gate(cfg: &ServerConfig) -> anyhow::Result<AuthorizationGate> {
	let secret = cfg.app.app_secret.clone().ok_or_else(|| anyhow!("app secret missing"))?;
	let app_id = cfg.app.app_id.clone().ok_or_else(|| anyhow!("app id missing"))?;
	let gate_cfg = GateConfig {
		app_id,
		grant_ttl: cfg.limits.grant_ttl,
		max_outstanding_grants: cfg.limits.max_outstanding_grants,
	};
	AuthorizationGate::new(secret, gate_cfg, system_clock()).context("build authorization gate")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let bind_addr = parse_args();

	let config_path = default_config_path()?;
	let server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded relay config (toml + env overrides)");
	server_cfg.validate().context("invalid relay configuration")?;

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let ctx = Arc::new(RelayContext::new(build_gate(&server_cfg)?, system_clock()));

	let health_state = HealthState::new(Arc::clone(ctx.registry()));
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => match spawn_health_server(addr, health_state.clone()).await {
				Ok(local) => info!(addr = %local, "health server listening"),
				Err(e) => warn!(error = %e, %bind, "failed to start health server"),
			},
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let quic_cfg = RelayQuicConfig::new(bind_addr);
	let endpoint = match (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		(Some(cert_path), Some(key_path)) => {
			info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
			quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
		}
		_ if server_cfg.app.force_tls => {
			return Err(anyhow!("force_tls is on but no TLS certificate/key is configured"));
		}
		_ => {
			let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
			let cert_out = config_path.with_file_name("relay-dev-cert.der");
			if let Some(dir) = cert_out.parent() {
				std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
			}
			std::fs::write(&cert_out, &server_cert_der)
				.with_context(|| format!("write dev certificate to {}", cert_out.display()))?;
			warn!(
				bind = %bind_addr,
				cert = %cert_out.display(),
				"shadow_relay: QUIC endpoint ready (dev self-signed cert; force_tls is off)"
			);
			endpoint
		}
	};

	info!(
		bind = %bind_addr,
		cluster = server_cfg.app.cluster.as_deref().unwrap_or_default(),
		"shadow_relay: accepting connections"
	);
	health_state.mark_ready();

	serve(endpoint, ctx, ConnectionSettings::from_config(&server_cfg)).await;
	Ok(())
}
