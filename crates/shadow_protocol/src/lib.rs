#![forbid(unsafe_code)]

pub mod convert;
pub mod framing;
pub mod pb;

pub use convert::{ChatMessageError, chat_message_from_domain, message_from_chat};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};

/// Event type names delivered on the events stream.
pub mod events {
	/// A chat message; payload is the message verbatim.
	pub const NEW_MESSAGE: &str = "new-message";
	/// The relay dropped messages for this subscriber because its queue was full.
	pub const CHANNEL_LAGGED: &str = "channel-lagged";
}

/// Protocol version constants.
pub mod version {
	pub const PROTOCOL_MAJOR: u32 = 1;
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;

	/// ALPN identifier negotiated by relay and client.
	pub const ALPN: &[u8] = b"shadow-v1";
}
