#![forbid(unsafe_code)]

//! Message lifetime rules.
//!
//! Every message carries an absolute `expires_at` set once at creation time to
//! `timestamp + MESSAGE_TTL_MS`. Liveness is a pure function of `(expires_at, now)`,
//! applied the same way by the relay and by clients.

use core::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{DisplayName, MessageId};

/// Fixed message lifetime: 5 minutes.
pub const MESSAGE_TTL_MS: i64 = 300_000;

/// Absolute expiry for a message created at `created_at_ms`.
#[inline]
pub const fn expires_at_for(created_at_ms: i64) -> i64 {
	created_at_ms.saturating_add(MESSAGE_TTL_MS)
}

/// A message is live strictly before its expiry instant.
#[inline]
pub const fn is_live(expires_at_ms: i64, now_ms: i64) -> bool {
	now_ms < expires_at_ms
}

/// Source of wall-clock time in Unix milliseconds.
pub trait Clock: Send + Sync + fmt::Debug {
	fn now_ms(&self) -> i64;
}

/// Clock backed by `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_ms(&self) -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}
}

/// Manually driven clock.
#[derive(Debug, Default)]
pub struct ManualClock {
	now_ms: AtomicI64,
}

impl ManualClock {
	pub fn new(now_ms: i64) -> Self {
		Self {
			now_ms: AtomicI64::new(now_ms),
		}
	}

	pub fn set(&self, now_ms: i64) {
		self.now_ms.store(now_ms, Ordering::SeqCst);
	}

	pub fn advance(&self, by_ms: i64) {
		self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
	}
}

impl Clock for ManualClock {
	fn now_ms(&self) -> i64 {
		self.now_ms.load(Ordering::SeqCst)
	}
}

/// An ephemeral chat message. Never mutated after creation.
///
/// Serialized field names match the `new-message` payload:
/// `id`, `username`, `text`, `timestamp`, `expiresAt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
	pub id: MessageId,
	pub username: String,
	pub text: String,
	pub timestamp: i64,
	pub expires_at: i64,
}

impl Message {
	/// Create a message stamped with the current time of `clock`.
	pub fn stamp(sender: &DisplayName, body: impl Into<String>, clock: &dyn Clock) -> Self {
		Self::stamp_at(sender, body, clock.now_ms())
	}

	/// Create a message stamped at an explicit creation instant.
	pub fn stamp_at(sender: &DisplayName, body: impl Into<String>, created_at_ms: i64) -> Self {
		Self {
			id: MessageId::new_v4(),
			username: sender.as_str().to_string(),
			text: body.into(),
			timestamp: created_at_ms,
			expires_at: expires_at_for(created_at_ms),
		}
	}

	pub fn is_live(&self, now_ms: i64) -> bool {
		is_live(self.expires_at, now_ms)
	}

	/// True when `expires_at` is exactly `timestamp + MESSAGE_TTL_MS`.
	pub fn has_valid_expiry(&self) -> bool {
		self.expires_at == expires_at_for(self.timestamp)
	}

	/// Milliseconds left before expiry, clamped at zero.
	pub fn remaining_ms(&self, now_ms: i64) -> i64 {
		self.expires_at.saturating_sub(now_ms).max(0)
	}
}
