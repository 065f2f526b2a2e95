#![forbid(unsafe_code)]

use bytes::{BufMut, BytesMut};
use prost::Message;
use thiserror::Error;

/// Default maximum frame payload size. Chat traffic is small; anything larger is hostile.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

const PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge { len: usize, max: usize },

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData { need: usize, have: usize },

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

fn check_len(len: usize, max: usize) -> Result<(), FramingError> {
	if len > max {
		return Err(FramingError::FrameTooLarge { len, max });
	}
	Ok(())
}

fn peek_len(src: &[u8]) -> Option<usize> {
	let prefix: [u8; PREFIX_LEN] = src.get(..PREFIX_LEN)?.try_into().ok()?;
	Some(u32::from_be_bytes(prefix) as usize)
}

/// Encode `msg` as `u32 big-endian length || protobuf payload`.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = msg.encoded_len();
	check_len(payload_len, max_frame_size)?;

	let mut out = Vec::with_capacity(frame_len_from_payload_len(payload_len));
	out.extend_from_slice(&(payload_len as u32).to_be_bytes());
	msg.encode(&mut out)?;
	Ok(out)
}

pub fn encode_frame_default<M: Message>(msg: &M) -> Result<Vec<u8>, FramingError> {
	encode_frame(msg, DEFAULT_MAX_FRAME_SIZE)
}

/// Append an encoded frame to `buf`.
pub fn encode_frame_into<M: Message>(buf: &mut BytesMut, msg: &M, max_frame_size: usize) -> Result<(), FramingError> {
	let payload_len = msg.encoded_len();
	check_len(payload_len, max_frame_size)?;

	buf.reserve(frame_len_from_payload_len(payload_len));
	buf.put_u32(payload_len as u32);
	msg.encode(buf)?;
	Ok(())
}

#[inline]
pub fn frame_len_from_payload_len(payload_len: usize) -> usize {
	PREFIX_LEN + payload_len
}

/// Decode one frame from the start of `src`, returning the message and bytes consumed.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	let len = peek_len(src).ok_or(FramingError::InsufficientData {
		need: PREFIX_LEN,
		have: src.len(),
	})?;
	check_len(len, max_frame_size)?;

	let need = frame_len_from_payload_len(len);
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[PREFIX_LEN..need])?;
	Ok((msg, need))
}

/// Pop one complete frame off `buf` if available.
///
/// Returns `Ok(None)` while more bytes are needed. An oversized length prefix
/// fails immediately, before the payload is buffered.
pub fn try_decode_frame_from_buffer<M: Message + Default>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<M>, FramingError> {
	let Some(len) = peek_len(buf) else {
		return Ok(None);
	};
	check_len(len, max_frame_size)?;

	let need = frame_len_from_payload_len(len);
	if buf.len() < need {
		return Ok(None);
	}

	let frame = buf.split_to(need);
	let msg = M::decode(&frame[PREFIX_LEN..])?;
	Ok(Some(msg))
}
