#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use quinn::{Endpoint, TransportConfig, VarInt};
use rustls::pki_types::CertificateDer;
use shadow_domain::{ChannelId, Clock, DisplayName, Message};
use shadow_protocol::pb::{self, envelope::Msg};
use shadow_protocol::version::ALPN;
use shadow_protocol::{DEFAULT_MAX_FRAME_SIZE, FramingError, chat_message_from_domain, encode_frame, try_decode_frame_from_buffer};
use shadow_util::{EndpointError, RelayEndpoint};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, info, warn};

pub mod view;

pub use view::{Applied, DEFAULT_SWEEP_INTERVAL, MessageView, remaining, spawn_sweeper};

/// How the client decides whether to trust the relay's certificate.
#[derive(Debug, Clone, Default)]
pub enum ServerTrust {
	/// Trust exactly these DER certificates (CA or the relay's own).
	Certificates(Vec<Vec<u8>>),
	/// Skip verification entirely. Development only.
	InsecureSkipVerify,
	/// Nothing configured; connecting fails.
	#[default]
	Unconfigured,
}

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote relay host (DNS name or IP literal); also the TLS server name.
	pub server_host: String,

	/// Remote relay UDP port.
	pub server_port: u16,

	/// Resolved address override.
	pub server_addr: Option<SocketAddr>,

	pub client_name: String,
	pub client_instance_id: String,

	/// Public application key presented in `Hello`.
	pub app_key: String,

	pub trust: ServerTrust,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Create a config from `quic://host:port`.
	pub fn from_endpoint(endpoint: &str) -> Result<Self, ClientError> {
		let e = RelayEndpoint::parse(endpoint)?;
		Ok(Self {
			server_host: e.server_name().to_string(),
			server_port: e.port,
			server_addr: None,
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 18203,
			server_addr: None,
			client_name: format!("shadow-client/{}", env!("CARGO_PKG_VERSION")),
			client_instance_id: format!("client-{}", std::process::id()),
			app_key: String::new(),
			trust: ServerTrust::Unconfigured,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Who this session speaks as. Passed explicitly to relay-facing calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
	pub display_name: DisplayName,
}

impl SessionContext {
	pub fn new(display_name: DisplayName) -> Self {
		Self { display_name }
	}

	/// Whether `message` was sent under this session's display name.
	pub fn is_own(&self, message: &Message) -> bool {
		message.username == self.display_name.as_str()
	}
}

/// Errors for client session operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("invalid relay endpoint: {0}")]
	InvalidEndpoint(#[from] EndpointError),

	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	#[error("failed to connect: {0}")]
	Connect(String),

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Unexpected message ordering/types.
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The relay answered with an `Error` frame.
	#[error("relay rejected the session: {code}: {message}")]
	Rejected { code: String, message: String },

	/// A request completed with a non-OK status.
	#[error("{step} refused: {status} ({detail})")]
	Refused {
		step: &'static str,
		status: String,
		detail: String,
	},

	#[error("io error: {0}")]
	Io(String),

	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientError {
	fn from(e: anyhow::Error) -> Self {
		ClientError::Other(format!("{e:#}"))
	}
}

/// Control half of a session.
pub struct SessionControl {
	conn: quinn::Connection,
	control_send: quinn::SendStream,
	control_recv: quinn::RecvStream,
	control_buf: BytesMut,
	connection_id: String,
	max_frame_bytes: usize,
	next_request_id: u64,
	events_opened: bool,
}

/// Events reader half of a session.
pub struct SessionEvents {
	events_recv: quinn::RecvStream,
	// Keep the send half alive so the peer doesn't see an immediate FIN.
	_events_send_keepalive: quinn::SendStream,
	max_frame_bytes: usize,
}

impl SessionControl {
	/// Connect and perform the handshake.
	pub async fn connect(cfg: ClientConfig) -> Result<(Self, pb::Welcome), ClientError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_client_config(&cfg.trust).map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let server_addr = match cfg.server_addr {
			Some(addr) => addr,
			None => RelayEndpoint {
				host: cfg.server_host.clone(),
				port: cfg.server_port,
			}
			.resolve()?,
		};

		let connecting = endpoint
			.connect_with(quinn_cfg, server_addr, &server_name)
			.map_err(|e| ClientError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

		let conn = match tokio::time::timeout(connect_timeout, connecting).await {
			Ok(Ok(c)) => c,
			Ok(Err(e)) => {
				return Err(ClientError::Connect(format!(
					"connect failed (addr={server_addr}, sni={server_name}): {e}"
				)));
			}
			Err(_) => {
				return Err(ClientError::Connect(format!(
					"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
				)));
			}
		};

		info!(remote = %conn.remote_address(), "connected");

		let (mut control_send, mut control_recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientError::Io(format!("timeout opening control stream after {connect_timeout:?}")))?
			.map_err(|e| ClientError::Io(format!("open_bi(control) failed: {e}")))?;

		let hello = pb::Hello {
			client_name: cfg.client_name,
			client_instance_id: cfg.client_instance_id,
			app_key: cfg.app_key,
		};
		write_envelope(
			&mut control_send,
			&pb::Envelope::new(String::new(), Msg::Hello(hello)),
			cfg.max_frame_bytes,
		)
		.await
		.map_err(|e| ClientError::Io(format!("send Hello failed: {e}")))?;

		let mut control_buf = BytesMut::with_capacity(8 * 1024);
		let welcome_env = tokio::time::timeout(
			connect_timeout,
			read_one_envelope(&mut control_recv, &mut control_buf, cfg.max_frame_bytes),
		)
		.await
		.map_err(|_| ClientError::Protocol(format!("timeout waiting for Welcome after {connect_timeout:?}")))??;

		let welcome = match welcome_env.msg {
			Some(Msg::Welcome(w)) => w,
			Some(Msg::Error(e)) => {
				return Err(ClientError::Rejected {
					code: e.code,
					message: e.message,
				});
			}
			other => {
				return Err(ClientError::Protocol(format!("expected Welcome, got {other:?}")));
			}
		};

		debug!(
			server_name = %welcome.server_name,
			connection_id = %welcome.connection_id,
			max_frame_bytes = welcome.max_frame_bytes,
			message_ttl_ms = welcome.message_ttl_ms,
			"received Welcome"
		);

		let control = Self {
			conn,
			control_send,
			control_recv,
			control_buf,
			connection_id: welcome.connection_id.clone(),
			max_frame_bytes: (welcome.max_frame_bytes as usize).min(cfg.max_frame_bytes),
			next_request_id: 1,
			events_opened: false,
		};

		Ok((control, welcome))
	}

	/// Relay-assigned id of this connection (`conn-<n>`).
	pub fn connection_id(&self) -> &str {
		&self.connection_id
	}

	/// Ask the relay for a grant to join `channel` as `ctx.display_name`.
	pub async fn authorize(&mut self, ctx: &SessionContext, channel: &ChannelId) -> Result<pb::AuthorizeResult, ClientError> {
		let msg = Msg::Authorize(pb::Authorize {
			connection_id: self.connection_id.clone(),
			channel_name: channel.transport_name(),
			display_name: ctx.display_name.as_str().to_string(),
		});

		match self.request(msg).await? {
			Msg::AuthorizeResult(r) => Ok(r),
			other => Err(ClientError::Protocol(format!("expected AuthorizeResult, got {other:?}"))),
		}
	}

	/// Redeem a grant and join its channel.
	pub async fn subscribe(&mut self, channel: &ChannelId, grant_token: &str) -> Result<pb::Subscribed, ClientError> {
		let msg = Msg::Subscribe(pb::Subscribe {
			channel_name: channel.transport_name(),
			grant_token: grant_token.to_string(),
		});

		match self.request(msg).await? {
			Msg::Subscribed(s) => {
				debug!(channel = %channel, status = s.status, "subscribe acknowledged");
				Ok(s)
			}
			other => Err(ClientError::Protocol(format!("expected Subscribed, got {other:?}"))),
		}
	}

	/// Authorize then subscribe; any non-OK status is an error.
	pub async fn join(&mut self, ctx: &SessionContext, channel: &ChannelId) -> Result<(), ClientError> {
		let auth = self.authorize(ctx, channel).await?;
		let grant = match (pb::authorize_result::Status::try_from(auth.status), auth.grant) {
			(Ok(pb::authorize_result::Status::Ok), Some(grant)) => grant,
			(status, _) => {
				return Err(ClientError::Refused {
					step: "authorize",
					status: status_name(status.map(|s| s.as_str_name())),
					detail: auth.detail,
				});
			}
		};

		let sub = self.subscribe(channel, &grant.token).await?;
		match pb::subscribed::Status::try_from(sub.status) {
			Ok(pb::subscribed::Status::Ok) => Ok(()),
			status => Err(ClientError::Refused {
				step: "subscribe",
				status: status_name(status.map(|s| s.as_str_name())),
				detail: sub.detail,
			}),
		}
	}

	pub async fn unsubscribe(&mut self, channel: &ChannelId) -> Result<pb::Unsubscribed, ClientError> {
		let msg = Msg::Unsubscribe(pb::Unsubscribe {
			channel_name: channel.transport_name(),
		});

		match self.request(msg).await? {
			Msg::Unsubscribed(u) => {
				debug!(channel = %channel, status = u.status, "unsubscribe acknowledged");
				Ok(u)
			}
			other => Err(ClientError::Protocol(format!("expected Unsubscribed, got {other:?}"))),
		}
	}

	/// Stamp `text` as a new message and publish it to `channel`.
	///
	/// Nothing is added to any local view here; the sender sees its own message
	/// only when the relay fans it back out.
	pub async fn publish(
		&mut self,
		ctx: &SessionContext,
		channel: &ChannelId,
		text: &str,
		clock: &dyn Clock,
	) -> Result<(Message, pb::Published), ClientError> {
		let message = Message::stamp(&ctx.display_name, text, clock);
		let published = self.publish_message(channel, &message).await?;
		Ok((message, published))
	}

	/// Publish an already stamped message.
	pub async fn publish_message(&mut self, channel: &ChannelId, message: &Message) -> Result<pb::Published, ClientError> {
		let msg = Msg::Publish(pb::Publish {
			channel_id: channel.as_str().to_string(),
			message: Some(chat_message_from_domain(message)),
		});

		match self.request(msg).await? {
			Msg::Published(p) => Ok(p),
			other => Err(ClientError::Protocol(format!("expected Published, got {other:?}"))),
		}
	}

	/// Send a keepalive ping and await the pong response.
	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<pb::Pong, ClientError> {
		match self.request(Msg::Ping(pb::Ping { client_time_unix_ms })).await? {
			Msg::Pong(p) => Ok(p),
			other => Err(ClientError::Protocol(format!("expected Pong, got {other:?}"))),
		}
	}

	/// Open the events stream after a successful subscribe.
	pub async fn open_events_stream(&mut self) -> Result<SessionEvents, ClientError> {
		if self.events_opened {
			return Err(ClientError::Protocol(
				"events stream already opened; reuse the existing SessionEvents".to_string(),
			));
		}

		debug!("open_events_stream(): opening events stream (client open_bi)");
		let (mut send, recv) = self
			.conn
			.open_bi()
			.await
			.map_err(|e| ClientError::Io(format!("open_bi(events) failed: {e}")))?;

		// Force a STREAM frame so the relay observes the stream promptly.
		send.write_all(&[0u8])
			.await
			.map_err(|e| ClientError::Io(format!("failed to write events stream activation byte: {e}")))?;
		send.flush()
			.await
			.map_err(|e| ClientError::Io(format!("failed to flush events stream activation byte: {e}")))?;

		self.events_opened = true;

		Ok(SessionEvents {
			events_recv: recv,
			_events_send_keepalive: send,
			max_frame_bytes: self.max_frame_bytes,
		})
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}

	async fn request(&mut self, msg: Msg) -> Result<Msg, ClientError> {
		let request_id = format!("req-{}", self.next_request_id);
		self.next_request_id += 1;

		write_envelope(
			&mut self.control_send,
			&pb::Envelope::new(request_id.clone(), msg),
			self.max_frame_bytes,
		)
		.await?;

		let resp = read_one_envelope(&mut self.control_recv, &mut self.control_buf, self.max_frame_bytes).await?;
		if resp.request_id != request_id {
			warn!(expected = %request_id, got = %resp.request_id, "response request id mismatch");
		}

		match resp.msg {
			Some(Msg::Error(e)) => Err(ClientError::Rejected {
				code: e.code,
				message: e.message,
			}),
			Some(msg) => Ok(msg),
			None => Err(ClientError::Protocol("empty response envelope".to_string())),
		}
	}
}

impl SessionEvents {
	/// Run the events loop until EOF or error.
	pub async fn run_events_loop<F>(&mut self, mut on_event: F) -> Result<(), ClientError>
	where
		F: FnMut(pb::Event),
	{
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match self.events_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => {
					info!("events stream closed");
					return Ok(());
				}
				Err(e) => return Err(ClientError::Io(e.to_string())),
			};

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match try_decode_frame_from_buffer::<pb::Envelope>(&mut buf, self.max_frame_bytes) {
					Ok(Some(env)) => match env.msg {
						Some(Msg::Event(ev)) => {
							debug!(channel = %ev.channel, event = %ev.event, "events stream decoded");
							on_event(ev)
						}
						Some(other) => warn!("unexpected message on events stream: {:?}", other),
						None => {}
					},
					Ok(None) => break,
					Err(e) => return Err(ClientError::Framing(e)),
				}
			}
		}
	}
}

/// Read a certificate to trust from `path`, PEM or raw DER.
pub fn load_trusted_cert(path: &Path) -> anyhow::Result<Vec<Vec<u8>>> {
	let bytes = std::fs::read(path).with_context(|| format!("read certificate: {}", path.display()))?;

	if bytes.starts_with(b"-----BEGIN") {
		let mut reader = std::io::BufReader::new(&bytes[..]);
		let certs = rustls_pemfile::certs(&mut reader)
			.map(|c| c.map(|c| c.to_vec()))
			.collect::<Result<Vec<_>, _>>()
			.context("parse PEM certificates")?;
		if certs.is_empty() {
			anyhow::bail!("no certificates found in {}", path.display());
		}
		return Ok(certs);
	}

	Ok(vec![bytes])
}

fn status_name(name: Result<&str, prost::UnknownEnumValue>) -> String {
	match name {
		Ok(n) => n.to_string(),
		Err(e) => format!("status {}", e.0),
	}
}

async fn write_envelope(
	send: &mut quinn::SendStream,
	env: &pb::Envelope,
	max_frame_bytes: usize,
) -> Result<(), ClientError> {
	let frame = encode_frame(env, max_frame_bytes).map_err(ClientError::Framing)?;
	send.write_all(&frame).await.map_err(|e| ClientError::Io(e.to_string()))?;
	send.flush().await.map_err(|e| ClientError::Io(e.to_string()))?;
	Ok(())
}

async fn read_one_envelope(
	recv: &mut quinn::RecvStream,
	buf: &mut BytesMut,
	max_frame_bytes: usize,
) -> Result<pb::Envelope, ClientError> {
	let mut tmp = [0u8; 8192];

	loop {
		match try_decode_frame_from_buffer::<pb::Envelope>(buf, max_frame_bytes) {
			Ok(Some(env)) => return Ok(env),
			Ok(None) => {}
			Err(e) => return Err(ClientError::Framing(e)),
		}

		let n = match recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => {
				return Err(ClientError::Protocol(
					"stream closed before receiving full message".to_string(),
				));
			}
			Err(e) => return Err(ClientError::Io(e.to_string())),
		};

		buf.extend_from_slice(&tmp[..n]);
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from(([0, 0, 0, 0], 0));
	Endpoint::client(addr).context("create client endpoint")
}

fn make_client_config(trust: &ServerTrust) -> anyhow::Result<quinn::ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let mut tls = match trust {
		ServerTrust::Certificates(ders) => {
			let mut roots = rustls::RootCertStore::empty();
			for der in ders {
				roots
					.add(CertificateDer::from(der.clone()))
					.context("add trusted certificate")?;
			}
			rustls::ClientConfig::builder()
				.with_root_certificates(roots)
				.with_no_client_auth()
		}
		ServerTrust::InsecureSkipVerify => {
			warn!("server certificate verification disabled");
			let mut tls = rustls::ClientConfig::builder()
				.with_root_certificates(rustls::RootCertStore::empty())
				.with_no_client_auth();
			tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
			tls
		}
		ServerTrust::Unconfigured => {
			anyhow::bail!("no trusted relay certificate configured (use a CA/cert or explicitly skip verification)");
		}
	};
	tls.alpn_protocols = vec![ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	let mut cfg = quinn::ClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(4));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

/// Accepts any server certificate. Only reachable through `ServerTrust::InsecureSkipVerify`.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &rustls::pki_types::CertificateDer<'_>,
		_intermediates: &[rustls::pki_types::CertificateDer<'_>],
		_server_name: &rustls::pki_types::ServerName<'_>,
		_ocsp_response: &[u8],
		_now: rustls::pki_types::UnixTime,
	) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::danger::ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &rustls::pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Err(rustls::Error::General("TLS1.2 not supported".into()))
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &rustls::pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		vec![
			rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
			rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA256,
			rustls::SignatureScheme::RSA_PSS_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA512,
			rustls::SignatureScheme::ED25519,
		]
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn connect_to_silent_address_fails_within_timeout() {
		let silent = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind");
		let cfg = ClientConfig {
			server_addr: Some(silent.local_addr().expect("addr")),
			trust: ServerTrust::InsecureSkipVerify,
			connect_timeout: Duration::from_millis(300),
			..ClientConfig::default()
		};

		let started = std::time::Instant::now();
		let err = SessionControl::connect(cfg).await.err().expect("nothing answers");
		assert!(matches!(err, ClientError::Connect(_)), "got {err:?}");
		assert!(started.elapsed() < Duration::from_secs(5));
	}

	#[test]
	fn refused_status_is_named_or_numbered() {
		let known = pb::subscribed::Status::try_from(pb::subscribed::Status::GrantMismatch as i32);
		assert_eq!(status_name(known.map(|s| s.as_str_name())), "GRANT_MISMATCH");

		let unknown = pb::authorize_result::Status::try_from(42);
		assert_eq!(status_name(unknown.map(|s| s.as_str_name())), "status 42");
	}

	#[test]
	fn default_config_requires_explicit_trust() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.server_host, "localhost");
		assert!(cfg.max_frame_bytes > 0);
		assert!(matches!(cfg.trust, ServerTrust::Unconfigured));
		assert!(make_client_config(&cfg.trust).is_err());
	}

	#[test]
	fn from_endpoint_strips_ipv6_brackets_for_sni() {
		let cfg = ClientConfig::from_endpoint("quic://[::1]:9000").expect("endpoint");
		assert_eq!(cfg.server_host, "::1");
		assert_eq!(cfg.server_port, 9000);

		assert!(matches!(
			ClientConfig::from_endpoint("http://localhost:1"),
			Err(ClientError::InvalidEndpoint(_))
		));
	}

	#[test]
	fn own_messages_are_recognised_by_display_name() {
		let me = DisplayName::new("Anonymous_Raven").expect("name");
		let ctx = SessionContext::new(me.clone());
		let mine = Message::stamp_at(&me, "hi", 0);
		let theirs = Message::stamp_at(&DisplayName::new("Heron").expect("name"), "yo", 0);
		assert!(ctx.is_own(&mine));
		assert!(!ctx.is_own(&theirs));
	}
}
