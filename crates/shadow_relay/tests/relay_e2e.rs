#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use shadow_client::{ClientConfig, ClientError, ServerTrust, SessionContext, SessionControl};
use shadow_domain::{ChannelId, DisplayName, MESSAGE_TTL_MS, ManualClock, SystemClock};
use shadow_protocol::pb::{self, event::Payload, published, unsubscribed};
use shadow_relay::config::SecretString;
use shadow_relay::quic::config::RelayQuicConfig;
use shadow_relay::util::time::{SharedClock, system_clock};
use shadow_relay::{AuthorizationGate, ConnectionSettings, GateConfig, RelayContext, serve};
use tokio::sync::mpsc;
use tokio::time::timeout;

const APP_KEY: &str = "pk-e2e";
const WAIT: Duration = Duration::from_secs(5);

struct Relay {
	addr: SocketAddr,
	cert_der: Vec<u8>,
	ctx: Arc<RelayContext>,
}

async fn start_relay() -> Relay {
	start_relay_with_clock(system_clock()).await
}

async fn start_relay_with_clock(clock: SharedClock) -> Relay {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let gate = AuthorizationGate::new(
		SecretString::new("e2e-secret"),
		GateConfig {
			app_id: "app-e2e".to_string(),
			grant_ttl: Duration::from_secs(30),
			max_outstanding_grants: 64,
		},
		Arc::clone(&clock),
	)
	.expect("gate");
	let ctx = Arc::new(RelayContext::new(gate, clock));

	let settings = ConnectionSettings {
		app_key: Some(SecretString::new(APP_KEY)),
		..ConnectionSettings::default()
	};

	let bind: SocketAddr = "127.0.0.1:0".parse().expect("addr");
	let (endpoint, cert_der) = RelayQuicConfig::new(bind).bind_dev_endpoint().expect("bind relay");
	let addr = endpoint.local_addr().expect("local addr");
	tokio::spawn(serve(endpoint, Arc::clone(&ctx), settings));

	Relay { addr, cert_der, ctx }
}

fn client_config(relay: &Relay, app_key: &str) -> ClientConfig {
	ClientConfig {
		server_host: "localhost".to_string(),
		server_port: relay.addr.port(),
		server_addr: Some(relay.addr),
		app_key: app_key.to_string(),
		trust: ServerTrust::Certificates(vec![relay.cert_der.clone()]),
		connect_timeout: WAIT,
		..ClientConfig::default()
	}
}

struct Participant {
	ctx: SessionContext,
	control: SessionControl,
	events: mpsc::UnboundedReceiver<pb::Event>,
}

impl Participant {
	async fn next_message(&mut self) -> pb::ChatMessage {
		loop {
			let ev = timeout(WAIT, self.events.recv())
				.await
				.expect("timed out waiting for an event")
				.expect("events stream ended");
			if let Some(Payload::NewMessage(m)) = ev.payload {
				return m;
			}
		}
	}

	async fn assert_quiet(&mut self) {
		let got = timeout(Duration::from_millis(300), self.events.recv()).await;
		assert!(got.is_err(), "expected no event, got {got:?}");
	}
}

async fn join(relay: &Relay, name: &str, group: &ChannelId) -> Participant {
	let (control, ctx) = join_without_listening(relay, name, group).await;
	listen(control, ctx).await
}

/// Subscribed, but the events stream is not open yet.
async fn join_without_listening(relay: &Relay, name: &str, group: &ChannelId) -> (SessionControl, SessionContext) {
	let (mut control, _welcome) = SessionControl::connect(client_config(relay, APP_KEY))
		.await
		.expect("connect");
	let ctx = SessionContext::new(DisplayName::new(name).expect("name"));
	control.join(&ctx, group).await.expect("join");
	(control, ctx)
}

async fn listen(mut control: SessionControl, ctx: SessionContext) -> Participant {
	let mut events = control.open_events_stream().await.expect("events stream");
	let (tx, rx) = mpsc::unbounded_channel();
	tokio::spawn(async move {
		let _ = events
			.run_events_loop(|ev| {
				let _ = tx.send(ev);
			})
			.await;
	});

	Participant {
		ctx,
		control,
		events: rx,
	}
}

fn group(id: &str) -> ChannelId {
	ChannelId::new(id).expect("group id")
}

#[tokio::test]
async fn publish_reaches_every_subscriber_including_sender() {
	let relay = start_relay().await;
	let alpha = group("alpha-7");

	let mut a = join(&relay, "Anonymous_Raven", &alpha).await;
	let mut b = join(&relay, "Quiet_Heron", &alpha).await;

	let (sent, ack) = a
		.control
		.publish(&a.ctx, &alpha, "hi", &SystemClock)
		.await
		.expect("publish");
	assert_eq!(ack.status, published::Status::Ok as i32);
	assert_eq!(ack.message_id, sent.id.as_str());
	assert_eq!(ack.attempted, 2);
	assert_eq!(ack.delivered, 2);

	let at_b = b.next_message().await;
	assert_eq!(at_b.id, sent.id.as_str());
	assert_eq!(at_b.username, "Anonymous_Raven");
	assert_eq!(at_b.text, "hi");
	assert_eq!(at_b.expires_at, sent.timestamp + MESSAGE_TTL_MS);

	let at_a = a.next_message().await;
	assert_eq!(at_a.id, sent.id.as_str());
}

#[tokio::test]
async fn late_joiner_sees_only_new_messages() {
	let relay = start_relay().await;
	let alpha = group("alpha-7");

	let mut a = join(&relay, "Anonymous_Raven", &alpha).await;
	a.control
		.publish(&a.ctx, &alpha, "before", &SystemClock)
		.await
		.expect("publish");
	assert_eq!(a.next_message().await.text, "before");

	let mut b = join(&relay, "Quiet_Heron", &alpha).await;
	a.control
		.publish(&a.ctx, &alpha, "after", &SystemClock)
		.await
		.expect("publish");

	assert_eq!(b.next_message().await.text, "after");
	b.assert_quiet().await;
}

#[tokio::test]
async fn publish_to_empty_group_succeeds_with_no_deliveries() {
	let relay = start_relay().await;
	let (mut control, _welcome) = SessionControl::connect(client_config(&relay, APP_KEY))
		.await
		.expect("connect");
	let ctx = SessionContext::new(DisplayName::new("Lonely_Owl").expect("name"));

	let (_sent, ack) = control
		.publish(&ctx, &group("nobody-here"), "echo?", &SystemClock)
		.await
		.expect("publish");
	assert_eq!(ack.status, published::Status::Ok as i32);
	assert_eq!(ack.attempted, 0);
	assert_eq!(ack.delivered, 0);
	assert_eq!(relay.ctx.registry().channel_count(), 0);
}

#[tokio::test]
async fn groups_are_isolated_and_unsubscribe_stops_delivery() {
	let relay = start_relay().await;
	let alpha = group("alpha-7");
	let beta = group("beta-9");

	let mut a = join(&relay, "Anonymous_Raven", &alpha).await;
	let mut b = join(&relay, "Quiet_Heron", &beta).await;

	a.control
		.publish(&a.ctx, &alpha, "alpha only", &SystemClock)
		.await
		.expect("publish");
	assert_eq!(a.next_message().await.text, "alpha only");
	b.assert_quiet().await;

	let left = a.control.unsubscribe(&alpha).await.expect("unsubscribe");
	assert_eq!(left.status, unsubscribed::Status::Ok as i32);
	let again = a.control.unsubscribe(&alpha).await.expect("unsubscribe again");
	assert_eq!(again.status, unsubscribed::Status::NotSubscribed as i32);

	let (_sent, ack) = b
		.control
		.publish(&b.ctx, &alpha, "anyone?", &SystemClock)
		.await
		.expect("publish");
	assert_eq!(ack.attempted, 0);
	a.assert_quiet().await;
}

#[tokio::test]
async fn queued_message_that_expires_before_the_stream_opens_is_not_delivered() {
	let clock = Arc::new(ManualClock::new(1_700_000_000_000));
	let relay = start_relay_with_clock(clock.clone()).await;
	let alpha = group("alpha-7");

	let (mut control, ctx) = join_without_listening(&relay, "Anonymous_Raven", &alpha).await;

	let (_stale, ack) = control
		.publish(&ctx, &alpha, "stale", &*clock)
		.await
		.expect("publish");
	assert_eq!(ack.status, published::Status::Ok as i32);
	assert_eq!(ack.delivered, 1);

	clock.advance(MESSAGE_TTL_MS);

	let (fresh, ack) = control
		.publish(&ctx, &alpha, "fresh", &*clock)
		.await
		.expect("publish");
	assert_eq!(ack.delivered, 1);

	let mut a = listen(control, ctx).await;
	let first = a.next_message().await;
	assert_eq!(first.id, fresh.id.as_str());
	assert_eq!(first.text, "fresh");
	a.assert_quiet().await;
}

#[tokio::test]
async fn disconnect_removes_subscription() {
	let relay = start_relay().await;
	let alpha = group("alpha-7");

	let mut a = join(&relay, "Anonymous_Raven", &alpha).await;
	let b = join(&relay, "Quiet_Heron", &alpha).await;
	assert_eq!(relay.ctx.registry().subscriber_count(&alpha), 2);

	b.control.close(0, "bye");
	drop(b);

	timeout(WAIT, async {
		while relay.ctx.registry().subscriber_count(&alpha) != 1 {
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
	})
	.await
	.expect("closed connection still subscribed");

	let (sent, ack) = a
		.control
		.publish(&a.ctx, &alpha, "still here?", &SystemClock)
		.await
		.expect("publish");
	assert_eq!(ack.attempted, 1);
	assert_eq!(ack.delivered, 1);
	assert_eq!(a.next_message().await.id, sent.id.as_str());
}

#[tokio::test]
async fn unknown_app_key_is_rejected_at_hello() {
	let relay = start_relay().await;
	let err = SessionControl::connect(client_config(&relay, "pk-wrong"))
		.await
		.err()
		.expect("handshake must fail");
	match err {
		ClientError::Rejected { code, .. } => assert_eq!(code, "UNKNOWN_APP"),
		other => panic!("expected Rejected, got {other:?}"),
	}
}

#[tokio::test]
async fn client_refuses_untrusted_relay_certificate() {
	let relay = start_relay().await;
	let other = foreign_cert(&relay);
	let cfg = ClientConfig {
		trust: ServerTrust::Certificates(vec![other]),
		..client_config(&relay, APP_KEY)
	};
	assert!(SessionControl::connect(cfg).await.is_err());
}

// A second dev endpoint gives a certificate the first relay did not sign with.
fn foreign_cert(relay: &Relay) -> Vec<u8> {
	let bind: SocketAddr = "127.0.0.1:0".parse().expect("addr");
	let (endpoint, cert_der) = RelayQuicConfig::new(bind).bind_dev_endpoint().expect("bind");
	endpoint.close(0u32.into(), b"unused");
	assert_ne!(cert_der, relay.cert_der);
	cert_der
}
