#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod expiry;

pub use expiry::{Clock, MESSAGE_TTL_MS, ManualClock, Message, SystemClock, expires_at_for, is_live};

/// Shortest accepted display name, in characters.
pub const DISPLAY_NAME_MIN_CHARS: usize = 3;

/// Longest accepted display name, in characters.
pub const DISPLAY_NAME_MAX_CHARS: usize = 20;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("too short: {len} chars (min {min})")]
	TooShort { len: usize, min: usize },
	#[error("too long: {len} chars (max {max})")]
	TooLong { len: usize, max: usize },
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Group (channel) identifier. Case-sensitive, compared by exact string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
	/// Prefix used for channel names at the transport boundary.
	pub const TRANSPORT_PREFIX: &'static str = "shadow-group-";

	/// Create a non-empty `ChannelId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}

	/// Transport channel name, e.g. `shadow-group-alpha-7`.
	pub fn transport_name(&self) -> String {
		format!("{}{}", Self::TRANSPORT_PREFIX, self.0)
	}

	/// Parse a `shadow-group-<id>` transport channel name.
	pub fn from_transport_name(s: &str) -> Result<Self, ParseIdError> {
		let rest = s
			.strip_prefix(Self::TRANSPORT_PREFIX)
			.ok_or_else(|| ParseIdError::InvalidFormat(format!("expected {}<id>", Self::TRANSPORT_PREFIX)))?;
		Self::new(rest)
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelId::new(s.to_string())
	}
}

/// Self-declared participant name.
///
/// The trimmed value must be at least [`DISPLAY_NAME_MIN_CHARS`] long and the
/// raw value at most [`DISPLAY_NAME_MAX_CHARS`]. The value is kept as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DisplayName(String);

impl DisplayName {
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed_len = name.trim().chars().count();
		if trimmed_len == 0 {
			return Err(ParseIdError::Empty);
		}
		if trimmed_len < DISPLAY_NAME_MIN_CHARS {
			return Err(ParseIdError::TooShort {
				len: trimmed_len,
				min: DISPLAY_NAME_MIN_CHARS,
			});
		}

		let len = name.chars().count();
		if len > DISPLAY_NAME_MAX_CHARS {
			return Err(ParseIdError::TooLong {
				len,
				max: DISPLAY_NAME_MAX_CHARS,
			});
		}

		Ok(Self(name))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for DisplayName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for DisplayName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		DisplayName::new(s.to_string())
	}
}

impl TryFrom<String> for DisplayName {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		DisplayName::new(value)
	}
}

impl From<DisplayName> for String {
	fn from(value: DisplayName) -> Self {
		value.0
	}
}

/// Message identifier, unique within a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	/// Wrap an id received from a peer.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn channel_ids_are_case_sensitive() {
		let a = ChannelId::new("Alpha-7").unwrap();
		let b = ChannelId::new("alpha-7").unwrap();
		assert_ne!(a, b);
		assert_eq!(a, "Alpha-7".parse::<ChannelId>().unwrap());
	}

	#[test]
	fn channel_transport_name_roundtrip() {
		let c = ChannelId::new("alpha-7").unwrap();
		assert_eq!(c.transport_name(), "shadow-group-alpha-7");
		assert_eq!(ChannelId::from_transport_name("shadow-group-alpha-7").unwrap(), c);
		assert!(ChannelId::from_transport_name("alpha-7").is_err());
		assert!(ChannelId::from_transport_name("shadow-group-").is_err());
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(ChannelId::new("").is_err());
		assert!(ChannelId::new("   ").is_err());
		assert!(MessageId::new("").is_err());
	}

	#[test]
	fn display_name_bounds() {
		assert_eq!(DisplayName::new(""), Err(ParseIdError::Empty));
		assert_eq!(DisplayName::new("    "), Err(ParseIdError::Empty));
		assert!(matches!(DisplayName::new("ab"), Err(ParseIdError::TooShort { len: 2, .. })));
		assert!(matches!(DisplayName::new(" ab "), Err(ParseIdError::TooShort { .. })));
		assert!(DisplayName::new("abc").is_ok());
		assert!(DisplayName::new("a".repeat(20)).is_ok());
		assert!(matches!(
			DisplayName::new("a".repeat(21)),
			Err(ParseIdError::TooLong { len: 21, .. })
		));
	}

	#[test]
	fn display_name_counts_chars_not_bytes() {
		assert!(DisplayName::new("ñandú_raven").is_ok());
		assert!(DisplayName::new("é".repeat(20)).is_ok());
	}

	#[test]
	fn display_name_deserialize_validates() {
		let ok: DisplayName = serde_json::from_str("\"Anonymous_Raven\"").unwrap();
		assert_eq!(ok.as_str(), "Anonymous_Raven");
		assert!(serde_json::from_str::<DisplayName>("\"x\"").is_err());
	}

	#[test]
	fn message_ids_are_unique() {
		assert_ne!(MessageId::new_v4(), MessageId::new_v4());
	}
}
