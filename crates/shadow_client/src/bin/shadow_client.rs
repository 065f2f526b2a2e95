#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use parking_lot::Mutex;
use shadow_client::{
	Applied, ClientConfig, DEFAULT_SWEEP_INTERVAL, MessageView, ServerTrust, SessionContext, SessionControl,
	load_trusted_cert, remaining, spawn_sweeper,
};
use shadow_domain::{ChannelId, Clock, DisplayName, SystemClock};
use shadow_protocol::pb::published;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: shadow_client --connect quic://host:port --name <display> --group <id> [--ca-cert path | --insecure]\n\
\n\
Options:\n\
	--connect   Relay endpoint (alias: --endpoint), format quic://host:port\n\
	--name      Display name (3-20 characters)\n\
	--group     Group id to join\n\
	--ca-cert   Certificate (PEM or DER) used to verify the relay\n\
	--insecure  Skip relay certificate verification (development only)\n\
	--app-key   Public application key (default: $SHADOW_APP_KEY)\n\
	--help      Show this help\n\
\n\
Lines typed on stdin are published to the group.\n\
\n\
Examples:\n\
	shadow_client --connect quic://127.0.0.1:18203 --name Anonymous_Raven --group alpha-7 --ca-cert ~/.shadow/relay-dev-cert.der\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,shadow_client=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

struct Args {
	endpoint: String,
	name: DisplayName,
	group: ChannelId,
	ca_cert: Option<PathBuf>,
	insecure: bool,
	app_key: Option<String>,
}

fn parse_args() -> Args {
	let mut endpoint: Option<String> = None;
	let mut name: Option<DisplayName> = None;
	let mut group: Option<ChannelId> = None;
	let mut ca_cert: Option<PathBuf> = None;
	let mut insecure = false;
	let mut app_key: Option<String> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				endpoint = Some(v);
			}
			"--name" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				name = Some(DisplayName::new(v).unwrap_or_else(|e| {
					eprintln!("Invalid --name: {e}");
					usage_and_exit()
				}));
			}
			"--group" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				group = Some(ChannelId::new(v).unwrap_or_else(|e| {
					eprintln!("Invalid --group: {e}");
					usage_and_exit()
				}));
			}
			"--ca-cert" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				ca_cert = Some(PathBuf::from(v));
			}
			"--insecure" => insecure = true,
			"--app-key" => {
				app_key = Some(it.next().unwrap_or_else(|| usage_and_exit()));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	if ca_cert.is_some() && insecure {
		eprintln!("--ca-cert and --insecure are mutually exclusive");
		usage_and_exit();
	}

	let (Some(endpoint), Some(name), Some(group)) = (endpoint, name, group) else {
		eprintln!("--connect, --name and --group are required");
		usage_and_exit();
	};

	Args {
		endpoint,
		name,
		group,
		ca_cert,
		insecure,
		app_key,
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let trust = match (&args.ca_cert, args.insecure) {
		(Some(path), _) => ServerTrust::Certificates(load_trusted_cert(path)?),
		(None, true) => ServerTrust::InsecureSkipVerify,
		(None, false) => anyhow::bail!("no way to verify the relay: pass --ca-cert <path> (or --insecure for development)"),
	};

	let app_key = args
		.app_key
		.or_else(|| std::env::var("SHADOW_APP_KEY").ok())
		.map(|v| v.trim().to_string())
		.unwrap_or_default();

	let cfg = ClientConfig {
		client_name: format!("shadow-client-cli/{}", env!("CARGO_PKG_VERSION")),
		client_instance_id: format!("cli-{}", std::process::id()),
		app_key,
		trust,
		..ClientConfig::from_endpoint(&args.endpoint)?
	};

	info!(server = %args.endpoint, group = %args.group, "connecting");

	let ctx = SessionContext::new(args.name);
	let clock: Arc<dyn Clock> = Arc::new(SystemClock);

	let (mut control, welcome) = SessionControl::connect(cfg).await?;
	control.join(&ctx, &args.group).await.context("join group")?;
	info!(
		connection_id = %welcome.connection_id,
		group = %args.group,
		"joined; messages vanish after {}s",
		welcome.message_ttl_ms / 1000
	);

	let mut events = control.open_events_stream().await?;

	let view = Arc::new(Mutex::new(MessageView::new(args.group.clone())));
	let _sweeper = spawn_sweeper(&view, Arc::clone(&clock), DEFAULT_SWEEP_INTERVAL);

	let events_task = {
		let view = Arc::clone(&view);
		let clock = Arc::clone(&clock);
		let ctx = ctx.clone();
		tokio::spawn(async move {
			events
				.run_events_loop(|ev| {
					let now = clock.now_ms();
					let mut view = view.lock();
					match view.apply_event(ev, now) {
						Applied::Inserted(id) => {
							if let Some(m) = view.visible(now).find(|m| m.id == id) {
								let tag = if ctx.is_own(m) { " (you)" } else { "" };
								println!("{}{tag} [{}]: {}", m.username, remaining(m, now), m.text);
							}
						}
						Applied::Lagged { dropped } => {
							warn!(dropped, "relay dropped messages; some history is missing");
						}
						Applied::Duplicate | Applied::Expired | Applied::Ignored => {}
					}
				})
				.await
		})
	};

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	while let Some(line) = lines.next_line().await? {
		let text = line.trim_end();
		if text.trim().is_empty() {
			continue;
		}
		let (_message, ack) = control.publish(&ctx, &args.group, text, clock.as_ref()).await?;
		if ack.status != published::Status::Ok as i32 {
			warn!(status = ack.status, detail = %ack.detail, "publish refused");
		}
	}

	control.close(0, "bye");
	events_task.abort();
	Ok(())
}
