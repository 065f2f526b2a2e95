#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use shadow_domain::{ChannelId, MESSAGE_TTL_MS};
use shadow_protocol::pb::{self, envelope::Msg};
use shadow_protocol::{DEFAULT_MAX_FRAME_SIZE, FramingError, chat_message_from_domain, encode_frame, events};
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{SecretString, ServerConfig};
use crate::server::gate::{AuthorizeRequest, Denial, RedeemError};
use crate::server::policy::{PublishLimiter, RateLimitSettings, validate_publish};
use crate::server::registry::{ConnectionHandle, ConnectionId, OutboundItem, RegistryError};
use crate::server::router::RouteError;
use crate::server::state::RelayContext;
use crate::util::time::SharedClock;

/// Decoded control frames waiting for the control loop.
pub(crate) const CONTROL_QUEUE_CAPACITY: usize = 32;

/// Per-connection relay settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub server_name: String,
	pub max_frame_bytes: u32,
	/// Key clients must present in `Hello`. `None` accepts any key.
	pub app_key: Option<SecretString>,
	pub subscriber_queue_capacity: usize,
	pub max_message_chars: usize,
	pub rate_limits: RateLimitSettings,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			server_name: format!("shadow-relay/{}", env!("CARGO_PKG_VERSION")),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			app_key: None,
			subscriber_queue_capacity: 256,
			max_message_chars: 2000,
			rate_limits: RateLimitSettings {
				per_conn_burst: 0,
				per_conn_per_minute: 0,
				per_channel_burst: 0,
				per_channel_per_minute: 0,
			},
		}
	}
}

impl ConnectionSettings {
	pub fn from_config(cfg: &ServerConfig) -> Self {
		let cluster = cfg.app.cluster.as_deref().unwrap_or("local");
		Self {
			server_name: format!("shadow-relay/{} ({cluster})", env!("CARGO_PKG_VERSION")),
			app_key: cfg.app.app_key.clone().map(SecretString::new),
			subscriber_queue_capacity: cfg.limits.subscriber_queue_capacity,
			max_message_chars: cfg.limits.max_message_chars,
			rate_limits: RateLimitSettings {
				per_conn_burst: cfg.limits.publish_rate_limit_per_conn_burst,
				per_conn_per_minute: cfg.limits.publish_rate_limit_per_conn_per_minute,
				per_channel_burst: cfg.limits.publish_rate_limit_per_channel_burst,
				per_channel_per_minute: cfg.limits.publish_rate_limit_per_channel_per_minute,
			},
			..Self::default()
		}
	}
}

pub async fn handle_connection(
	conn_id: ConnectionId,
	connection: quinn::Connection,
	ctx: Arc<RelayContext>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("shadow_relay_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("shadow_relay_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut control_send, control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<pb::Envelope>(CONTROL_QUEUE_CAPACITY);
	let max_frame = settings.max_frame_bytes as usize;
	let reader_task = tokio::spawn(read_control_frames(control_recv, ctrl_tx, max_frame));

	let hello = wait_for_hello(&mut ctrl_rx).await?;
	info!(
		conn_id = %conn_id,
		client_name = %hello.client_name,
		client_instance_id = %hello.client_instance_id,
		"received Hello"
	);
	metrics::counter!("shadow_relay_hello_total").increment(1);

	if let Some(expected) = settings.app_key.as_ref()
		&& hello.app_key.trim() != expected.expose()
	{
		warn!(conn_id = %conn_id, "unknown application key");
		metrics::counter!("shadow_relay_hello_rejected_total").increment(1);
		send_envelope(
			&mut control_send,
			error_envelope(String::new(), "UNKNOWN_APP", "application key not recognised"),
		)
		.await
		.ok();
		let _ = control_send.finish();
		let _ = tokio::time::timeout(Duration::from_secs(2), control_send.stopped()).await;
		reader_task.abort();
		return Ok(());
	}

	let welcome = pb::Welcome {
		server_name: settings.server_name.clone(),
		connection_id: conn_id.to_string(),
		server_time_unix_ms: ctx.clock.now_ms(),
		max_frame_bytes: settings.max_frame_bytes,
		message_ttl_ms: MESSAGE_TTL_MS,
	};
	send_envelope(&mut control_send, pb::Envelope::new(String::new(), Msg::Welcome(welcome)))
		.await
		.context("send Welcome")?;

	let (outbox_tx, outbox_rx) = mpsc::channel::<OutboundItem>(settings.subscriber_queue_capacity.max(1));
	let handle = ConnectionHandle::new(conn_id, &outbox_tx);
	let mut outbox_rx = Some(outbox_rx);
	let mut events_task: Option<tokio::task::JoinHandle<anyhow::Result<()>>> = None;
	let mut limiter = PublishLimiter::new(settings.rate_limits);

	let loop_result = async {
		while let Some(env) = ctrl_rx.recv().await {
			let Some(msg) = env.msg else {
				continue;
			};

			match msg {
				Msg::Authorize(req) => {
					let result = handle_authorize(conn_id, &ctx, &req);
					send_envelope(
						&mut control_send,
						pb::Envelope::new(env.request_id, Msg::AuthorizeResult(result)),
					)
					.await?;
				}

				Msg::Subscribe(sub) => {
					let result = handle_subscribe(&ctx, &handle, &sub);
					let ok = result.status == pb::subscribed::Status::Ok as i32;
					send_envelope(&mut control_send, pb::Envelope::new(env.request_id, Msg::Subscribed(result)))
						.await?;

					if ok && events_task.is_none()
						&& let Some(rx) = outbox_rx.take()
					{
						info!(conn_id = %conn_id, "waiting to accept events bidirectional stream (client-opened; after Subscribed)");
						events_task = Some(tokio::spawn(run_events_writer(
							conn_id,
							connection.clone(),
							rx,
							Arc::clone(&ctx.clock),
							max_frame,
						)));
					}
				}

				Msg::Unsubscribe(unsub) => {
					let result = handle_unsubscribe(&ctx, &handle, &unsub);
					send_envelope(
						&mut control_send,
						pb::Envelope::new(env.request_id, Msg::Unsubscribed(result)),
					)
					.await?;
				}

				Msg::Publish(publish) => {
					let result = handle_publish(conn_id, &ctx, &settings, &mut limiter, publish);
					send_envelope(&mut control_send, pb::Envelope::new(env.request_id, Msg::Published(result)))
						.await?;
				}

				Msg::Ping(ping) => {
					let pong = pb::Pong {
						client_time_unix_ms: ping.client_time_unix_ms,
						server_time_unix_ms: ctx.clock.now_ms(),
					};
					send_envelope(&mut control_send, pb::Envelope::new(env.request_id, Msg::Pong(pong))).await?;
				}

				Msg::Hello(_) => {
					debug!(conn_id = %conn_id, "ignoring duplicate Hello");
				}

				other => {
					warn!(conn_id = %conn_id, "unhandled control message: {:?}", other);
					send_envelope(
						&mut control_send,
						error_envelope(env.request_id, "UNEXPECTED_MESSAGE", "message not valid on the control stream"),
					)
					.await?;
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	if let Some(channel) = ctx.registry().remove_connection(&handle) {
		debug!(conn_id = %conn_id, channel = %channel, "connection closed, removed subscription");
	}
	drop(outbox_tx);

	reader_task.abort();
	let _ = reader_task.await;
	if let Some(task) = events_task {
		task.abort();
		let _ = task.await;
	}

	loop_result
}

fn handle_authorize(conn_id: ConnectionId, ctx: &RelayContext, req: &pb::Authorize) -> pb::AuthorizeResult {
	use pb::authorize_result::Status;

	metrics::counter!("shadow_relay_authorize_requests_total").increment(1);
	let request = AuthorizeRequest {
		connection_id: &req.connection_id,
		channel_name: &req.channel_name,
		display_name: &req.display_name,
	};

	match ctx.gate.authorize(conn_id, request) {
		Ok(grant) => pb::AuthorizeResult {
			status: Status::Ok as i32,
			grant: Some(pb::Grant {
				token: grant.token,
				channel_name: grant.channel.transport_name(),
				expires_at_unix_ms: grant.expires_at_ms,
			}),
			detail: String::new(),
		},
		Err(denial) => {
			debug!(conn_id = %conn_id, channel = %req.channel_name, reason = %denial, "authorization denied");
			metrics::counter!("shadow_relay_authorize_denied_total").increment(1);
			let status = match denial {
				Denial::InvalidChannel(_) => Status::InvalidChannel,
				Denial::InvalidDisplayName(_) => Status::InvalidDisplayName,
				Denial::ConnectionMismatch => Status::ConnectionMismatch,
				Denial::CapacityExceeded { .. } => Status::CapacityExceeded,
			};
			pb::AuthorizeResult {
				status: status as i32,
				grant: None,
				detail: denial.to_string(),
			}
		}
	}
}

fn handle_subscribe(ctx: &RelayContext, handle: &ConnectionHandle, sub: &pb::Subscribe) -> pb::Subscribed {
	use pb::subscribed::Status;

	metrics::counter!("shadow_relay_subscribe_requests_total").increment(1);
	let reply = |status: Status, detail: String| pb::Subscribed {
		status: status as i32,
		channel_name: sub.channel_name.clone(),
		detail,
	};

	let channel = match ChannelId::from_transport_name(&sub.channel_name) {
		Ok(c) => c,
		Err(e) => return reply(Status::InvalidChannel, e.to_string()),
	};

	if let Some(current) = handle.current_channel() {
		if current == channel {
			return reply(Status::Ok, String::new());
		}
		let err = RegistryError::AlreadySubscribed { current };
		return reply(Status::AlreadySubscribed, err.to_string());
	}

	let redeemed = match ctx.gate.redeem(handle.id(), &sub.channel_name, &sub.grant_token) {
		Ok(r) => r,
		Err(e) => {
			debug!(conn_id = %handle.id(), channel = %channel, reason = %e, "grant redeem failed");
			let status = match e {
				RedeemError::InvalidGrant => Status::InvalidGrant,
				RedeemError::GrantExpired => Status::GrantExpired,
				RedeemError::GrantMismatch => Status::GrantMismatch,
			};
			return reply(status, e.to_string());
		}
	};

	match ctx
		.registry()
		.subscribe(&redeemed.channel, handle, redeemed.display_name, ctx.clock.now_ms())
	{
		Ok(()) => {
			info!(conn_id = %handle.id(), channel = %redeemed.channel, "subscribed");
			reply(Status::Ok, String::new())
		}
		Err(e @ RegistryError::AlreadySubscribed { .. }) => reply(Status::AlreadySubscribed, e.to_string()),
	}
}

fn handle_unsubscribe(ctx: &RelayContext, handle: &ConnectionHandle, unsub: &pb::Unsubscribe) -> pb::Unsubscribed {
	use pb::unsubscribed::Status;

	metrics::counter!("shadow_relay_unsubscribe_requests_total").increment(1);
	let removed = ChannelId::from_transport_name(&unsub.channel_name)
		.map(|channel| ctx.registry().unsubscribe(&channel, handle))
		.unwrap_or(false);

	if removed {
		info!(conn_id = %handle.id(), channel = %unsub.channel_name, "unsubscribed");
	}

	let status = if removed { Status::Ok } else { Status::NotSubscribed };
	pb::Unsubscribed {
		status: status as i32,
		channel_name: unsub.channel_name.clone(),
	}
}

fn handle_publish(
	conn_id: ConnectionId,
	ctx: &RelayContext,
	settings: &ConnectionSettings,
	limiter: &mut PublishLimiter,
	publish: pb::Publish,
) -> pb::Published {
	use pb::published::Status;

	metrics::counter!("shadow_relay_publish_requests_total").increment(1);
	let message_id = publish.message.as_ref().map(|m| m.id.clone()).unwrap_or_default();
	let rejected = |status: Status, detail: String| pb::Published {
		status: status as i32,
		message_id: message_id.clone(),
		attempted: 0,
		delivered: 0,
		detail,
	};

	let (channel, message) = match validate_publish(publish, ctx.clock.now_ms(), settings.max_message_chars) {
		Ok(v) => v,
		Err(e) => {
			debug!(conn_id = %conn_id, reason = %e, "publish rejected");
			metrics::counter!("shadow_relay_publish_rejected_total").increment(1);
			return rejected(e.status(), e.to_string());
		}
	};

	if let Err(e) = limiter.check(&channel) {
		debug!(conn_id = %conn_id, channel = %channel, reason = %e, "publish rate limited");
		metrics::counter!("shadow_relay_publish_rate_limited_total").increment(1);
		return rejected(e.status(), e.to_string());
	}

	match ctx.router.publish_to(&channel, message) {
		Ok(report) => {
			debug!(
				conn_id = %conn_id,
				channel = %channel,
				attempted = report.attempted,
				delivered = report.delivered,
				dropped = report.dropped,
				unreachable = report.unreachable,
				"published"
			);
			pb::Published {
				status: Status::Ok as i32,
				message_id,
				attempted: report.attempted as u32,
				delivered: report.delivered as u32,
				detail: String::new(),
			}
		}
		Err(e) => {
			let status = match e {
				RouteError::Expired => Status::Rejected,
				RouteError::EmptyChannel => Status::InvalidPayload,
			};
			rejected(status, e.to_string())
		}
	}
}

/// Drains the connection's outbound queue onto the client-opened events stream.
///
/// Expired messages still sitting in the queue are discarded here.
async fn run_events_writer(
	conn_id: ConnectionId,
	connection: quinn::Connection,
	mut outbox: mpsc::Receiver<OutboundItem>,
	clock: SharedClock,
	max_frame: usize,
) -> anyhow::Result<()> {
	let (mut events_send, _events_recv) = connection
		.accept_bi()
		.await
		.context("accept events bidirectional stream")?;
	info!(conn_id = %conn_id, "accepted events bidirectional stream (server will only write)");

	while let Some(item) = outbox.recv().await {
		let now = clock.now_ms();
		let event = match item {
			OutboundItem::Message { channel, message } => {
				if !message.is_live(now) {
					metrics::counter!("shadow_relay_expired_purged_total").increment(1);
					continue;
				}
				pb::Event {
					channel: channel.transport_name(),
					event: events::NEW_MESSAGE.to_string(),
					server_time_unix_ms: now,
					payload: Some(pb::event::Payload::NewMessage(chat_message_from_domain(&message))),
				}
			}
			OutboundItem::Lagged { channel, dropped } => {
				warn!(conn_id = %conn_id, channel = %channel, dropped, "subscriber lagged; messages dropped");
				pb::Event {
					channel: channel.transport_name(),
					event: events::CHANNEL_LAGGED.to_string(),
					server_time_unix_ms: now,
					payload: Some(pb::event::Payload::ChannelLagged(pb::ChannelLagged { dropped })),
				}
			}
		};

		let frame = encode_frame(&pb::Envelope::new(String::new(), Msg::Event(event)), max_frame)?;
		events_send.write_all(&frame).await.context("events stream write")?;
		metrics::counter!("shadow_relay_events_out_total").increment(1);
		metrics::counter!("shadow_relay_events_bytes_out_total").increment(frame.len() as u64);
	}

	let _ = events_send.finish();
	Ok(())
}

/// Decode control frames from `recv` into `ctrl_tx` until EOF.
///
/// A full queue stops reading, so a peer that never drains its replies
/// runs into stream flow control instead of growing relay memory.
pub(crate) async fn read_control_frames<R>(
	mut recv: R,
	ctrl_tx: mpsc::Sender<pb::Envelope>,
	max_frame: usize,
) -> anyhow::Result<()>
where
	R: AsyncRead + Unpin,
{
	let mut buf = Vec::<u8>::with_capacity(16 * 1024);
	let mut tmp = [0u8; 8192];

	loop {
		let n = recv.read(&mut tmp).await.context("control stream read failed")?;
		if n == 0 {
			return Ok(());
		}

		metrics::counter!("shadow_relay_control_bytes_in_total").increment(n as u64);
		buf.extend_from_slice(&tmp[..n]);

		loop {
			match shadow_protocol::decode_frame::<pb::Envelope>(&buf, max_frame) {
				Ok((msg, used)) => {
					buf.drain(0..used);
					metrics::counter!("shadow_relay_envelopes_in_total").increment(1);
					if ctrl_tx.send(msg).await.is_err() {
						return Ok(());
					}
				}
				Err(FramingError::InsufficientData { .. }) => break,
				Err(e) => {
					metrics::counter!("shadow_relay_control_decode_errors_total").increment(1);
					return Err(anyhow!(e).context("failed to decode control frame"));
				}
			}
		}
	}
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::Receiver<pb::Envelope>) -> anyhow::Result<pb::Hello> {
	while let Some(env) = ctrl_rx.recv().await {
		let Some(msg) = env.msg else { continue };
		if let Msg::Hello(h) = msg {
			return Ok(h);
		}
	}
	Err(anyhow!("connection closed before Hello"))
}

fn error_envelope(request_id: String, code: &str, message: &str) -> pb::Envelope {
	pb::Envelope::new(
		request_id,
		Msg::Error(pb::Error {
			code: code.to_string(),
			message: message.to_string(),
		}),
	)
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope) -> anyhow::Result<()> {
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	metrics::counter!("shadow_relay_envelopes_out_total").increment(1);
	metrics::counter!("shadow_relay_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}
