#![forbid(unsafe_code)]

//! Publish policy: payload validation, body bounds and rate limiting in front
//! of the broadcast router.

use std::collections::HashMap;
use std::time::Instant;

use shadow_domain::{ChannelId, Message};
use shadow_protocol::{message_from_chat, pb};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
	#[error("channel id is empty")]
	EmptyChannel,

	#[error("message is missing")]
	MissingMessage,

	#[error("message id is empty")]
	EmptyMessageId,

	#[error("expiresAt must equal timestamp + ttl")]
	InvalidExpiry,

	#[error("message already expired")]
	Expired,

	#[error("message text is empty")]
	EmptyText,

	#[error("message text too long: {len} chars (max {max})")]
	TextTooLong { len: usize, max: usize },

	#[error("message text contains control characters")]
	ControlCharacters,

	#[error("sender name is empty")]
	EmptySender,

	#[error("rate limited ({scope})")]
	RateLimited { scope: &'static str },
}

impl PublishError {
	pub fn status(&self) -> pb::published::Status {
		match self {
			Self::Expired => pb::published::Status::Rejected,
			Self::RateLimited { .. } => pb::published::Status::RateLimited,
			_ => pb::published::Status::InvalidPayload,
		}
	}
}

/// Validate an inbound `Publish` against the payload rules and return the
/// channel and message to route.
pub fn validate_publish(
	publish: pb::Publish,
	now_ms: i64,
	max_message_chars: usize,
) -> Result<(ChannelId, Message), PublishError> {
	let channel = ChannelId::new(publish.channel_id).map_err(|_| PublishError::EmptyChannel)?;
	let chat = publish.message.ok_or(PublishError::MissingMessage)?;

	let message = message_from_chat(chat).map_err(|_| PublishError::EmptyMessageId)?;
	if message.username.trim().is_empty() {
		return Err(PublishError::EmptySender);
	}

	if !message.has_valid_expiry() {
		return Err(PublishError::InvalidExpiry);
	}
	if !message.is_live(now_ms) {
		return Err(PublishError::Expired);
	}

	check_body(&message.text, max_message_chars)?;
	Ok((channel, message))
}

fn check_body(text: &str, max_chars: usize) -> Result<(), PublishError> {
	if text.trim().is_empty() {
		return Err(PublishError::EmptyText);
	}

	let len = text.chars().count();
	if len > max_chars {
		return Err(PublishError::TextTooLong { len, max: max_chars });
	}

	if text.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
		return Err(PublishError::ControlCharacters);
	}

	Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
	pub per_conn_burst: u32,
	pub per_conn_per_minute: u32,
	pub per_channel_burst: u32,
	pub per_channel_per_minute: u32,
}

#[derive(Debug)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32, now: Instant) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: now,
		})
	}

	/// Whether the bucket has refilled to capacity, making it equivalent to a fresh one.
	fn is_full_at(&self, now: Instant) -> bool {
		let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
		self.tokens + elapsed * self.refill_per_sec >= self.capacity
	}

	fn allow(&mut self, now: Instant) -> bool {
		let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Per-connection publish limiter. A zero burst or rate disables that bucket.
///
/// At most `max_channels` per-channel buckets are tracked. Only refilled
/// buckets are forgotten to make room; while every tracked bucket is still
/// draining, publishes to untracked channels are limited.
#[derive(Debug)]
pub struct PublishLimiter {
	settings: RateLimitSettings,
	per_connection: Option<TokenBucket>,
	per_channel: HashMap<ChannelId, TokenBucket>,
	max_channels: usize,
}

impl PublishLimiter {
	pub fn new(settings: RateLimitSettings) -> Self {
		Self {
			settings,
			per_connection: TokenBucket::new(settings.per_conn_burst, settings.per_conn_per_minute, Instant::now()),
			per_channel: HashMap::new(),
			max_channels: 64,
		}
	}

	pub fn check(&mut self, channel: &ChannelId) -> Result<(), PublishError> {
		self.check_at(channel, Instant::now())
	}

	pub(crate) fn check_at(&mut self, channel: &ChannelId, now: Instant) -> Result<(), PublishError> {
		if let Some(bucket) = self.per_connection.as_mut()
			&& !bucket.allow(now)
		{
			return Err(PublishError::RateLimited { scope: "connection" });
		}

		let Some(fresh) = TokenBucket::new(self.settings.per_channel_burst, self.settings.per_channel_per_minute, now)
		else {
			return Ok(());
		};

		if self.per_channel.len() >= self.max_channels && !self.per_channel.contains_key(channel) {
			self.per_channel.retain(|_, b| !b.is_full_at(now));
			if self.per_channel.len() >= self.max_channels {
				return Err(PublishError::RateLimited { scope: "channel" });
			}
		}

		let bucket = self.per_channel.entry(channel.clone()).or_insert(fresh);
		if bucket.allow(now) {
			Ok(())
		} else {
			Err(PublishError::RateLimited { scope: "channel" })
		}
	}
}
