//! Binary framing for the raw TCP transport. Each frame is a 7-byte header
//! (1B version, 1B type, 1B flags, 4B big-endian payload length) followed by
//! the payload, which is always a UTF-8 JSON-RPC message for types 1-3.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::A2aError;

pub const FRAME_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 7;

/// 16MB; a frame larger than this is a protocol violation, not a real payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
	Message = 1,
	Notification = 2,
	Response = 3,
	Ping = 4,
	Pong = 5,
}

impl FrameType {
	pub fn from_u8(value: u8) -> Option<FrameType> {
		match value {
			1 => Some(FrameType::Message),
			2 => Some(FrameType::Notification),
			3 => Some(FrameType::Response),
			4 => Some(FrameType::Ping),
			5 => Some(FrameType::Pong),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
	pub frame_type: FrameType,
	pub flags: u8,
	pub payload: Bytes,
}

impl Frame {
	pub fn message(payload: Bytes) -> Frame {
		Frame {
			frame_type: FrameType::Message,
			flags: 0,
			payload,
		}
	}

	pub fn notification(payload: Bytes) -> Frame {
		Frame {
			frame_type: FrameType::Notification,
			flags: 0,
			payload,
		}
	}

	pub fn response(payload: Bytes) -> Frame {
		Frame {
			frame_type: FrameType::Response,
			flags: 0,
			payload,
		}
	}

	pub fn ping() -> Frame {
		Frame {
			frame_type: FrameType::Ping,
			flags: 0,
			payload: Bytes::new(),
		}
	}

	pub fn pong() -> Frame {
		Frame {
			frame_type: FrameType::Pong,
			flags: 0,
			payload: Bytes::new(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
	max_payload: usize,
}

impl FrameCodec {
	pub fn new(max_payload: usize) -> FrameCodec {
		FrameCodec { max_payload }
	}
}

impl Default for FrameCodec {
	fn default() -> Self {
		FrameCodec::new(DEFAULT_MAX_PAYLOAD)
	}
}

impl Decoder for FrameCodec {
	type Item = Frame;
	type Error = A2aError;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, A2aError> {
		if src.len() < HEADER_LEN {
			// Partial header; wait for more bytes without consuming.
			return Ok(None);
		}
		if src[0] != FRAME_VERSION {
			return Err(A2aError::protocol(format!(
				"unsupported frame version {}",
				src[0]
			)));
		}
		let frame_type = FrameType::from_u8(src[1])
			.ok_or_else(|| A2aError::protocol(format!("unknown frame type {}", src[1])))?;
		let flags = src[2];
		let len = BigEndian::read_u32(&src[3..HEADER_LEN]) as usize;
		if len > self.max_payload {
			return Err(A2aError::protocol(format!(
				"frame payload of {len} bytes exceeds limit of {}",
				self.max_payload
			)));
		}
		if src.len() < HEADER_LEN + len {
			// Partial payload; the stream must not advance until it all arrives.
			src.reserve(HEADER_LEN + len - src.len());
			return Ok(None);
		}
		src.advance(HEADER_LEN);
		let payload = src.split_to(len).freeze();
		Ok(Some(Frame {
			frame_type,
			flags,
			payload,
		}))
	}
}

impl Encoder<Frame> for FrameCodec {
	type Error = A2aError;

	fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), A2aError> {
		if item.payload.len() > self.max_payload {
			return Err(A2aError::protocol(format!(
				"refusing to encode {} byte payload (limit {})",
				item.payload.len(),
				self.max_payload
			)));
		}
		dst.reserve(HEADER_LEN + item.payload.len());
		dst.put_u8(FRAME_VERSION);
		dst.put_u8(item.frame_type as u8);
		dst.put_u8(item.flags);
		dst.put_u32(item.payload.len() as u32);
		dst.put_slice(&item.payload);
		Ok(())
	}
}
