//! gRPC-over-HTTP/2 transport. Reuses the h2 session machinery; each message
//! is a unary call carrying a length-prefixed JSON-encoded JSON-RPC payload
//! (`content-type: application/grpc+json`), with `grpc-status` trailers mapped
//! into the fabric error taxonomy.

use std::sync::atomic::{AtomicBool, Ordering};

use a2a_wire::{A2aError, A2aMessage};
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use fabric_core::prelude::*;
use h2::client::SendRequest;
use tokio_util::sync::CancellationToken;

use super::conn::{ConnShared, EventSender, ProtocolHandle};
use super::http2;
use crate::config::PeerConfig;

const GRPC_PREFIX_LEN: usize = 5;

pub(crate) struct GrpcHandle {
	send_req: SendRequest<Bytes>,
	uri: String,
	bearer: Option<String>,
	shared: Arc<ConnShared>,
	open: Arc<AtomicBool>,
	stop: CancellationToken,
}

pub(crate) async fn connect(
	conn_id: Strng,
	config: &PeerConfig,
	shared: Arc<ConnShared>,
	events: EventSender,
) -> Result<Arc<GrpcHandle>, A2aError> {
	let stream = http2::open_stream(config).await?;
	let open = Arc::new(AtomicBool::new(true));
	let stop = CancellationToken::new();
	let send_req = http2::session(conn_id, stream, events, open.clone(), stop.clone()).await?;
	let scheme = if config.tls.is_some() { "https" } else { "http" };
	let uri = format!(
		"{}://{}:{}{}",
		scheme,
		config.host,
		config.port_or_default(),
		config.path_or_default()
	);
	Ok(Arc::new(GrpcHandle {
		send_req,
		uri,
		bearer: config.auth.bearer().map(str::to_string),
		shared,
		open,
		stop,
	}))
}

/// 1-byte compression flag (always 0) + 4-byte big-endian length + payload.
pub(crate) fn encode_grpc(payload: &[u8]) -> Bytes {
	let mut buf = BytesMut::with_capacity(GRPC_PREFIX_LEN + payload.len());
	buf.put_u8(0);
	buf.put_u32(payload.len() as u32);
	buf.put_slice(payload);
	buf.freeze()
}

pub(crate) fn decode_grpc(buf: &Bytes) -> Result<Bytes, A2aError> {
	if buf.len() < GRPC_PREFIX_LEN {
		return Err(A2aError::protocol("truncated grpc message prefix"));
	}
	if buf[0] != 0 {
		return Err(A2aError::protocol("compressed grpc payloads not supported"));
	}
	let len = BigEndian::read_u32(&buf[1..GRPC_PREFIX_LEN]) as usize;
	if buf.len() < GRPC_PREFIX_LEN + len {
		return Err(A2aError::protocol("truncated grpc message payload"));
	}
	Ok(buf.slice(GRPC_PREFIX_LEN..GRPC_PREFIX_LEN + len))
}

pub(crate) fn map_grpc_status(code: u32, message: &str) -> A2aError {
	let text = if message.is_empty() {
		format!("grpc status {code}")
	} else {
		message.to_string()
	};
	match code {
		3 => A2aError::validation(text),
		4 => A2aError::timeout(text),
		5 | 12 => A2aError::capability_not_found(text),
		7 => A2aError::authorization(text),
		8 => A2aError::resource_exhausted(text),
		14 => A2aError::unavailable(text).mark_retryable(true),
		16 => A2aError::authentication(text),
		_ => A2aError::internal(text),
	}
}

fn grpc_status(headers: &http::HeaderMap) -> Option<(u32, String)> {
	let code = headers
		.get("grpc-status")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse::<u32>().ok())?;
	let message = headers
		.get("grpc-message")
		.and_then(|v| v.to_str().ok())
		.unwrap_or_default()
		.to_string();
	Some((code, message))
}

impl GrpcHandle {
	fn build_request(&self, len: usize) -> Result<http::Request<()>, A2aError> {
		let mut builder = http::Request::builder()
			.method(http::Method::POST)
			.uri(&self.uri)
			.header(http::header::CONTENT_TYPE, "application/grpc+json")
			.header(http::header::CONTENT_LENGTH, len)
			.header(http::header::TE, "trailers");
		if let Some(token) = &self.bearer {
			builder = builder.header(http::header::AUTHORIZATION, format!("Bearer {token}"));
		}
		builder
			.body(())
			.map_err(|e| A2aError::internal(format!("building request: {e}")))
	}

	async fn unary(&self, msg: &A2aMessage) -> Result<Bytes, A2aError> {
		let payload = encode_grpc(&msg.to_bytes()?);
		let request = self.build_request(payload.len())?;
		let payload_len = payload.len() as u64;
		let mut send_req = self
			.send_req
			.clone()
			.ready()
			.await
			.map_err(|e| A2aError::routing(format!("h2 not ready: {e}")))?;
		let (response, mut stream) = send_req
			.send_request(request, false)
			.map_err(|e| A2aError::routing(format!("opening grpc stream: {e}")))?;
		stream
			.send_data(payload, true)
			.map_err(|e| A2aError::routing(format!("grpc write: {e}")))?;
		self
			.shared
			.stats
			.bytes_sent
			.fetch_add(payload_len, Ordering::Relaxed);
		self
			.shared
			.stats
			.messages_sent
			.fetch_add(1, Ordering::Relaxed);

		let response = response
			.await
			.map_err(|e| A2aError::routing(format!("grpc request failed: {e}")))?;
		let status = response.status();
		if status != http::StatusCode::OK {
			return Err(
				A2aError::routing(format!("grpc request returned http status {status}"))
					.with_status(status.as_u16()),
			);
		}
		// Trailers-only responses put grpc-status in the initial headers.
		if let Some((code, message)) = grpc_status(response.headers()) {
			if code != 0 {
				return Err(map_grpc_status(code, &message));
			}
		}
		let mut body = response.into_body();
		let data = http2::read_body_ref(&self.shared, &mut body).await?;
		let trailers = body
			.trailers()
			.await
			.map_err(|e| A2aError::routing(format!("grpc trailers: {e}")))?;
		if let Some((code, message)) = trailers.as_ref().and_then(|t| grpc_status(t)) {
			if code != 0 {
				return Err(map_grpc_status(code, &message));
			}
		}
		decode_grpc(&data)
	}
}

#[async_trait]
impl ProtocolHandle for GrpcHandle {
	async fn send_request(&self, msg: &A2aMessage) -> Result<A2aMessage, A2aError> {
		let payload = self.unary(msg).await?;
		self
			.shared
			.stats
			.messages_received
			.fetch_add(1, Ordering::Relaxed);
		A2aMessage::from_slice(&payload)
	}

	async fn send_notification(&self, msg: &A2aMessage) -> Result<(), A2aError> {
		let _ = self.unary(msg).await?;
		Ok(())
	}

	fn is_open(&self) -> bool {
		self.open.load(Ordering::Relaxed) && !self.stop.is_cancelled()
	}

	async fn close(&self) {
		self.open.store(false, Ordering::Relaxed);
		self.stop.cancel();
	}
}
