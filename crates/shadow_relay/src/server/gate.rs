#![forbid(unsafe_code)]

//! Channel authorization gate.
//!
//! `authorize` validates a (connection, channel, display name) request and issues
//! a short-lived signed grant; it never touches the subscription registry. The
//! transport later `redeem`s the grant exactly once to complete a subscription.
//!
//! Token format: `v1.<base64url(json claims)>.<base64url(hmac-sha256)>`.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use shadow_domain::{ChannelId, DisplayName, ParseIdError};
use thiserror::Error;
use tracing::debug;

use crate::config::SecretString;
use crate::server::registry::ConnectionId;
use crate::util::time::SharedClock;

const TOKEN_VERSION: &str = "v1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
	#[error("grant signing secret must not be empty")]
	EmptySecret,
}

/// Reasons an authorization request is refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Denial {
	#[error("invalid channel name: {0}")]
	InvalidChannel(ParseIdError),

	#[error("invalid display name: {0}")]
	InvalidDisplayName(ParseIdError),

	#[error("connection id does not belong to the caller")]
	ConnectionMismatch,

	#[error("too many outstanding grants (max {max})")]
	CapacityExceeded { max: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RedeemError {
	#[error("grant is malformed, forged or already used")]
	InvalidGrant,

	#[error("grant expired")]
	GrantExpired,

	#[error("grant was issued for a different connection or channel")]
	GrantMismatch,
}

/// Incoming authorization request, fields as received on the wire.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizeRequest<'a> {
	pub connection_id: &'a str,
	/// Transport channel name (`shadow-group-<id>`).
	pub channel_name: &'a str,
	pub display_name: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
	pub token: String,
	pub channel: ChannelId,
	pub display_name: DisplayName,
	pub expires_at_ms: i64,
}

/// What a successfully redeemed grant binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeemedGrant {
	pub channel: ChannelId,
	pub display_name: DisplayName,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
	/// Included in every grant and checked on redeem.
	pub app_id: String,
	pub grant_ttl: Duration,
	pub max_outstanding_grants: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GrantClaims {
	app: String,
	conn: String,
	channel: String,
	name: String,
	exp: i64,
	nonce: String,
}

#[derive(Debug)]
pub struct AuthorizationGate {
	secret: SecretString,
	cfg: GateConfig,
	clock: SharedClock,
	/// nonce -> expiry of issued, not yet redeemed grants.
	outstanding: Mutex<HashMap<String, i64>>,
}

impl AuthorizationGate {
	pub fn new(secret: SecretString, cfg: GateConfig, clock: SharedClock) -> Result<Self, GateError> {
		if secret.expose().is_empty() {
			return Err(GateError::EmptySecret);
		}
		Ok(Self {
			secret,
			cfg,
			clock,
			outstanding: Mutex::new(HashMap::new()),
		})
	}

	pub fn authorize(&self, caller: ConnectionId, req: AuthorizeRequest<'_>) -> Result<Grant, Denial> {
		let channel = ChannelId::from_transport_name(req.channel_name).map_err(Denial::InvalidChannel)?;
		let display_name = DisplayName::new(req.display_name).map_err(Denial::InvalidDisplayName)?;
		if req.connection_id != caller.to_string() {
			return Err(Denial::ConnectionMismatch);
		}

		let now = self.clock.now_ms();
		let expires_at_ms = now.saturating_add(self.cfg.grant_ttl.as_millis() as i64);
		let nonce = uuid::Uuid::new_v4().simple().to_string();

		{
			let mut outstanding = self.outstanding.lock();
			outstanding.retain(|_, exp| *exp > now);
			if outstanding.len() >= self.cfg.max_outstanding_grants {
				metrics::counter!("shadow_relay_grants_denied_capacity_total").increment(1);
				return Err(Denial::CapacityExceeded {
					max: self.cfg.max_outstanding_grants,
				});
			}
			outstanding.insert(nonce.clone(), expires_at_ms);
		}

		let claims = GrantClaims {
			app: self.cfg.app_id.clone(),
			conn: caller.to_string(),
			channel: channel.as_str().to_string(),
			name: display_name.as_str().to_string(),
			exp: expires_at_ms,
			nonce,
		};

		debug!(conn_id = %caller, channel = %channel, "gate: grant issued");
		Ok(Grant {
			token: self.sign_claims(&claims),
			channel,
			display_name,
			expires_at_ms,
		})
	}

	/// Verify and consume a grant for `caller` subscribing to `channel_name`.
	pub fn redeem(&self, caller: ConnectionId, channel_name: &str, token: &str) -> Result<RedeemedGrant, RedeemError> {
		let claims = self.verify_claims(token)?;
		let now = self.clock.now_ms();

		let mut outstanding = self.outstanding.lock();
		outstanding.retain(|_, exp| *exp > now);

		if claims.exp <= now {
			return Err(RedeemError::GrantExpired);
		}

		let requested = ChannelId::from_transport_name(channel_name).map_err(|_| RedeemError::GrantMismatch)?;
		if claims.app != self.cfg.app_id || claims.conn != caller.to_string() || claims.channel != requested.as_str() {
			return Err(RedeemError::GrantMismatch);
		}

		if outstanding.remove(&claims.nonce).is_none() {
			return Err(RedeemError::InvalidGrant);
		}
		drop(outstanding);

		let display_name = DisplayName::new(claims.name).map_err(|_| RedeemError::InvalidGrant)?;
		Ok(RedeemedGrant {
			channel: requested,
			display_name,
		})
	}

	pub fn outstanding_grants(&self) -> usize {
		self.outstanding.lock().len()
	}

	fn sign_claims(&self, claims: &GrantClaims) -> String {
		// Serializing a struct of strings and integers cannot fail.
		let payload = serde_json::to_vec(claims).unwrap_or_default();
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes());
		format!("{TOKEN_VERSION}.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig))
	}

	fn verify_claims(&self, token: &str) -> Result<GrantClaims, RedeemError> {
		let mut parts = token.split('.');
		let (Some(TOKEN_VERSION), Some(payload_b64), Some(sig_b64), None) =
			(parts.next(), parts.next(), parts.next(), parts.next())
		else {
			return Err(RedeemError::InvalidGrant);
		};

		let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| RedeemError::InvalidGrant)?;
		let expected_sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes());
		if expected_sig.is_empty() || !constant_time_eq(&expected_sig, &provided_sig) {
			return Err(RedeemError::InvalidGrant);
		}

		let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| RedeemError::InvalidGrant)?;
		serde_json::from_slice(&payload).map_err(|_| RedeemError::InvalidGrant)
	}
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
		return Vec::new();
	};
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}
	diff == 0
}
