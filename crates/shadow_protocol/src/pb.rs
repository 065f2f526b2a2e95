#![forbid(unsafe_code)]
#![allow(clippy::large_enum_variant)]

//! Wire messages (`shadow.v1`).
//!
//! Channel names on the wire are transport names (`shadow-group-<id>`), except
//! `Publish.channel_id` which carries the bare group id.

/// Top-level frame on every stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	/// Echoed back on the response to a request. Empty for unsolicited frames.
	#[prost(string, tag = "2")]
	pub request_id: ::prost::alloc::string::String,
	#[prost(
		oneof = "envelope::Msg",
		tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23"
	)]
	pub msg: ::core::option::Option<envelope::Msg>,
}

pub mod envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "10")]
		Hello(super::Hello),
		#[prost(message, tag = "11")]
		Welcome(super::Welcome),
		#[prost(message, tag = "12")]
		Authorize(super::Authorize),
		#[prost(message, tag = "13")]
		AuthorizeResult(super::AuthorizeResult),
		#[prost(message, tag = "14")]
		Subscribe(super::Subscribe),
		#[prost(message, tag = "15")]
		Subscribed(super::Subscribed),
		#[prost(message, tag = "16")]
		Unsubscribe(super::Unsubscribe),
		#[prost(message, tag = "17")]
		Unsubscribed(super::Unsubscribed),
		#[prost(message, tag = "18")]
		Publish(super::Publish),
		#[prost(message, tag = "19")]
		Published(super::Published),
		#[prost(message, tag = "20")]
		Ping(super::Ping),
		#[prost(message, tag = "21")]
		Pong(super::Pong),
		#[prost(message, tag = "22")]
		Error(super::Error),
		#[prost(message, tag = "23")]
		Event(super::Event),
	}
}

impl Envelope {
	pub fn new(request_id: impl Into<String>, msg: envelope::Msg) -> Self {
		Self {
			version: crate::version::PROTOCOL_MAJOR,
			request_id: request_id.into(),
			msg: Some(msg),
		}
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	#[prost(string, tag = "1")]
	pub client_name: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub client_instance_id: ::prost::alloc::string::String,
	/// Public application key; must match the relay's configured key.
	#[prost(string, tag = "3")]
	pub app_key: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	#[prost(string, tag = "1")]
	pub server_name: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub connection_id: ::prost::alloc::string::String,
	#[prost(int64, tag = "3")]
	pub server_time_unix_ms: i64,
	#[prost(uint32, tag = "4")]
	pub max_frame_bytes: u32,
	#[prost(int64, tag = "5")]
	pub message_ttl_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Authorize {
	#[prost(string, tag = "1")]
	pub connection_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub channel_name: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub display_name: ::prost::alloc::string::String,
}

/// Signed, short-lived permission to subscribe.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Grant {
	#[prost(string, tag = "1")]
	pub token: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub channel_name: ::prost::alloc::string::String,
	#[prost(int64, tag = "3")]
	pub expires_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthorizeResult {
	#[prost(enumeration = "authorize_result::Status", tag = "1")]
	pub status: i32,
	#[prost(message, optional, tag = "2")]
	pub grant: ::core::option::Option<Grant>,
	#[prost(string, tag = "3")]
	pub detail: ::prost::alloc::string::String,
}

pub mod authorize_result {
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
	#[repr(i32)]
	pub enum Status {
		Unspecified = 0,
		Ok = 1,
		InvalidChannel = 2,
		InvalidDisplayName = 3,
		ConnectionMismatch = 4,
		CapacityExceeded = 5,
	}

	impl Status {
		/// Upper snake-case variant name, as carried in status details and logs.
		pub fn as_str_name(&self) -> &'static str {
			match self {
				Self::Unspecified => "UNSPECIFIED",
				Self::Ok => "OK",
				Self::InvalidChannel => "INVALID_CHANNEL",
				Self::InvalidDisplayName => "INVALID_DISPLAY_NAME",
				Self::ConnectionMismatch => "CONNECTION_MISMATCH",
				Self::CapacityExceeded => "CAPACITY_EXCEEDED",
			}
		}
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Subscribe {
	#[prost(string, tag = "1")]
	pub channel_name: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub grant_token: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Subscribed {
	#[prost(enumeration = "subscribed::Status", tag = "1")]
	pub status: i32,
	#[prost(string, tag = "2")]
	pub channel_name: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub detail: ::prost::alloc::string::String,
}

pub mod subscribed {
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
	#[repr(i32)]
	pub enum Status {
		Unspecified = 0,
		Ok = 1,
		InvalidGrant = 2,
		GrantExpired = 3,
		GrantMismatch = 4,
		AlreadySubscribed = 5,
		InvalidChannel = 6,
	}

	impl Status {
		/// Upper snake-case variant name, as carried in status details and logs.
		pub fn as_str_name(&self) -> &'static str {
			match self {
				Self::Unspecified => "UNSPECIFIED",
				Self::Ok => "OK",
				Self::InvalidGrant => "INVALID_GRANT",
				Self::GrantExpired => "GRANT_EXPIRED",
				Self::GrantMismatch => "GRANT_MISMATCH",
				Self::AlreadySubscribed => "ALREADY_SUBSCRIBED",
				Self::InvalidChannel => "INVALID_CHANNEL",
			}
		}
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Unsubscribe {
	#[prost(string, tag = "1")]
	pub channel_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Unsubscribed {
	#[prost(enumeration = "unsubscribed::Status", tag = "1")]
	pub status: i32,
	#[prost(string, tag = "2")]
	pub channel_name: ::prost::alloc::string::String,
}

pub mod unsubscribed {
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
	#[repr(i32)]
	pub enum Status {
		Unspecified = 0,
		Ok = 1,
		/// Informational; the unsubscribe is still a successful no-op.
		NotSubscribed = 2,
	}

	impl Status {
		/// Upper snake-case variant name, as carried in status details and logs.
		pub fn as_str_name(&self) -> &'static str {
			match self {
				Self::Unspecified => "UNSPECIFIED",
				Self::Ok => "OK",
				Self::NotSubscribed => "NOT_SUBSCRIBED",
			}
		}
	}
}

/// Chat message payload, field-for-field the `new-message` body.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessage {
	#[prost(string, tag = "1")]
	pub id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub username: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub text: ::prost::alloc::string::String,
	#[prost(int64, tag = "4")]
	pub timestamp: i64,
	#[prost(int64, tag = "5")]
	pub expires_at: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Publish {
	#[prost(string, tag = "1")]
	pub channel_id: ::prost::alloc::string::String,
	#[prost(message, optional, tag = "2")]
	pub message: ::core::option::Option<ChatMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Published {
	#[prost(enumeration = "published::Status", tag = "1")]
	pub status: i32,
	#[prost(string, tag = "2")]
	pub message_id: ::prost::alloc::string::String,
	#[prost(uint32, tag = "3")]
	pub attempted: u32,
	#[prost(uint32, tag = "4")]
	pub delivered: u32,
	#[prost(string, tag = "5")]
	pub detail: ::prost::alloc::string::String,
}

pub mod published {
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
	#[repr(i32)]
	pub enum Status {
		Unspecified = 0,
		Ok = 1,
		InvalidPayload = 2,
		RateLimited = 3,
		Rejected = 4,
	}

	impl Status {
		/// Upper snake-case variant name, as carried in status details and logs.
		pub fn as_str_name(&self) -> &'static str {
			match self {
				Self::Unspecified => "UNSPECIFIED",
				Self::Ok => "OK",
				Self::InvalidPayload => "INVALID_PAYLOAD",
				Self::RateLimited => "RATE_LIMITED",
				Self::Rejected => "REJECTED",
			}
		}
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	#[prost(string, tag = "1")]
	pub code: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub message: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelLagged {
	#[prost(uint64, tag = "1")]
	pub dropped: u64,
}

/// Frame written on the events stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
	#[prost(string, tag = "1")]
	pub channel: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub event: ::prost::alloc::string::String,
	#[prost(int64, tag = "3")]
	pub server_time_unix_ms: i64,
	#[prost(oneof = "event::Payload", tags = "10, 11")]
	pub payload: ::core::option::Option<event::Payload>,
}

pub mod event {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Payload {
		#[prost(message, tag = "10")]
		NewMessage(super::ChatMessage),
		#[prost(message, tag = "11")]
		ChannelLagged(super::ChannelLagged),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_names_are_upper_snake_case() {
		assert_eq!(authorize_result::Status::InvalidDisplayName.as_str_name(), "INVALID_DISPLAY_NAME");
		assert_eq!(subscribed::Status::AlreadySubscribed.as_str_name(), "ALREADY_SUBSCRIBED");
		assert_eq!(unsubscribed::Status::NotSubscribed.as_str_name(), "NOT_SUBSCRIBED");
		assert_eq!(published::Status::RateLimited.as_str_name(), "RATE_LIMITED");

		let wire = subscribed::Status::GrantExpired as i32;
		assert_eq!(
			subscribed::Status::try_from(wire).ok().map(|s| s.as_str_name()),
			Some("GRANT_EXPIRED")
		);
	}
}
