//! Framed TCP transport: length-prefixed binary frames (see `a2a_wire::frame`)
//! over a plain or TLS socket. Responses are matched to callers by scanning
//! decoded frames for the awaited request id.

use std::sync::atomic::{AtomicBool, Ordering};

use a2a_wire::frame::HEADER_LEN;
use a2a_wire::{A2aError, A2aMessage, Frame, FrameCodec, FrameType, MessageType, Value};
use async_trait::async_trait;
use fabric_core::prelude::*;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::conn::{ConnEvent, ConnShared, EventSender, Listeners, ProtocolHandle};
use crate::config::PeerConfig;

pub(crate) struct TcpHandle {
	writer: mpsc::Sender<Frame>,
	shared: Arc<ConnShared>,
	open: Arc<AtomicBool>,
	stop: CancellationToken,
}

pub(crate) async fn connect(
	conn_id: Strng,
	config: &PeerConfig,
	shared: Arc<ConnShared>,
	events: EventSender,
) -> Result<Arc<TcpHandle>, A2aError> {
	let addr = format!("{}:{}", config.host, config.port_or_default());
	let connect_timeout = config.connect_timeout.unwrap_or(Duration::from_secs(10));
	let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
		.await
		.map_err(|_| A2aError::timeout(format!("connect to {addr} timed out")))?
		.map_err(|e| A2aError::routing(format!("connect to {addr}: {e}")))?;

	if config.keep_alive {
		let sock = socket2::SockRef::from(&stream);
		sock
			.set_keepalive(true)
			.map_err(|e| A2aError::routing(format!("enabling keep-alive: {e}")))?;
	}

	let handle = match &config.tls {
		Some(tls) => {
			let tls_config = super::tls::client_config(tls, false)?;
			let server_name = super::tls::server_name(&config.host)?;
			let connector = tokio_rustls::TlsConnector::from(tls_config);
			let stream = connector
				.connect(server_name, stream)
				.await
				.map_err(|e| A2aError::routing(format!("tls handshake with {addr}: {e}")))?;
			start(conn_id, stream, shared, events)
		},
		None => start(conn_id, stream, shared, events),
	};

	// Token auth is carried in a handshake message on raw TCP.
	if let Some(token) = config.auth.bearer() {
		let handshake = A2aMessage::notification(
			"auth.handshake",
			[("token".to_string(), Value::from(token))]
				.into_iter()
				.collect(),
			"local",
			config.peer.to_string(),
		)
		.with_type(MessageType::SecurityHandshake);
		handle.send_notification(&handshake).await?;
	}

	Ok(handle)
}

/// Drive the frame protocol over any byte stream. Split out from [`connect`] so
/// tests can run it over in-memory duplex pipes.
pub(crate) fn start<S>(
	conn_id: Strng,
	stream: S,
	shared: Arc<ConnShared>,
	events: EventSender,
) -> Arc<TcpHandle>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let framed = Framed::new(stream, FrameCodec::default());
	let (mut sink, mut source) = framed.split();
	let (writer_tx, mut writer_rx) = mpsc::channel::<Frame>(64);
	let open = Arc::new(AtomicBool::new(true));
	let stop = CancellationToken::new();

	let write_open = open.clone();
	let write_stop = stop.clone();
	let write_shared = shared.clone();
	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = write_stop.cancelled() => break,
				frame = writer_rx.recv() => {
					let Some(frame) = frame else { break };
					let size = (HEADER_LEN + frame.payload.len()) as u64;
					if let Err(e) = sink.send(frame).await {
						debug!("frame write failed: {e}");
						write_open.store(false, Ordering::Relaxed);
						break;
					}
					write_shared.stats.bytes_sent.fetch_add(size, Ordering::Relaxed);
				},
			}
		}
	});

	let read_open = open.clone();
	let read_stop = stop.clone();
	let read_shared = shared.clone();
	let pong_tx = writer_tx.clone();
	tokio::spawn(async move {
		let close_error = loop {
			tokio::select! {
				_ = read_stop.cancelled() => break None,
				frame = source.next() => match frame {
					Some(Ok(frame)) => {
						read_shared.touch();
						read_shared
							.stats
							.bytes_received
							.fetch_add((HEADER_LEN + frame.payload.len()) as u64, Ordering::Relaxed);
						handle_frame(&read_shared, &pong_tx, frame).await;
					},
					Some(Err(e)) => {
						read_shared.stats.errors.fetch_add(1, Ordering::Relaxed);
						break Some(e);
					},
					None => break None,
				},
			}
		};
		if !read_stop.is_cancelled() {
			read_open.store(false, Ordering::Relaxed);
			let _ = events.send(ConnEvent::Closed {
				conn: conn_id,
				error: close_error,
			});
		}
	});

	Arc::new(TcpHandle {
		writer: writer_tx,
		shared,
		open,
		stop,
	})
}

async fn handle_frame(shared: &Arc<ConnShared>, writer: &mpsc::Sender<Frame>, frame: Frame) {
	match frame.frame_type {
		// Pings are answered in the transport, without application involvement.
		FrameType::Ping => {
			let _ = writer.send(Frame::pong()).await;
		},
		FrameType::Pong => {},
		FrameType::Message | FrameType::Notification | FrameType::Response => {
			match A2aMessage::from_slice(&frame.payload) {
				Ok(msg) if msg.is_response() => {
					shared
						.stats
						.messages_received
						.fetch_add(1, Ordering::Relaxed);
					if let Some(id) = msg.id.clone() {
						if !shared.listeners.complete(&id, msg) {
							trace!(%id, "no listener for response, discarding");
						}
					}
				},
				Ok(msg) => {
					trace!(method = ?msg.method, "ignoring peer-initiated message");
				},
				Err(e) => {
					shared.stats.errors.fetch_add(1, Ordering::Relaxed);
					warn!("undecodable frame payload: {e}");
				},
			}
		},
	}
}

impl TcpHandle {
	async fn write(&self, frame: Frame) -> Result<(), A2aError> {
		self
			.writer
			.send(frame)
			.await
			.map_err(|_| A2aError::routing("connection is closed"))
	}
}

#[async_trait]
impl ProtocolHandle for TcpHandle {
	async fn send_request(&self, msg: &A2aMessage) -> Result<A2aMessage, A2aError> {
		let id = msg
			.id
			.clone()
			.ok_or_else(|| A2aError::internal("request has no id"))?;
		let payload = msg.to_bytes()?;
		let (_guard, rx) = Listeners::register(&self.shared, id);
		self.write(Frame::message(payload)).await?;
		self
			.shared
			.stats
			.messages_sent
			.fetch_add(1, Ordering::Relaxed);
		rx.await
			.map_err(|_| A2aError::routing("connection closed while awaiting response"))
	}

	async fn send_notification(&self, msg: &A2aMessage) -> Result<(), A2aError> {
		let payload = msg.to_bytes()?;
		self.write(Frame::notification(payload)).await?;
		self
			.shared
			.stats
			.messages_sent
			.fetch_add(1, Ordering::Relaxed);
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

#[cfg(test)]
mod tests {
	use super::*;
	use a2a_wire::RequestId;
	use fabric_core::strng;
	use tokio::sync::mpsc::unbounded_channel;
	use tokio_util::codec::{Encoder, Framed};

	/// A fake peer speaking the frame protocol over the far end of a duplex pipe.
	fn fake_peer(
		stream: tokio::io::DuplexStream,
	) -> Framed<tokio::io::DuplexStream, FrameCodec> {
		Framed::new(stream, FrameCodec::default())
	}

	#[tokio::test]
	async fn request_response() {
		let (client, server) = tokio::io::duplex(4096);
		let (events, _events_rx) = unbounded_channel();
		let shared = ConnShared::new();
		let handle = start(strng::new("c1"), client, shared, events);

		let mut peer = fake_peer(server);
		let responder = tokio::spawn(async move {
			let frame = peer.next().await.unwrap().unwrap();
			assert_eq!(frame.frame_type, FrameType::Message);
			let req = A2aMessage::from_slice(&frame.payload).unwrap();
			let resp = A2aMessage::response_to(&req, Value::from(42u64), "peer");
			peer
				.send(Frame::response(resp.to_bytes().unwrap()))
				.await
				.unwrap();
		});

		let req =
			A2aMessage::request("math.answer", Value::object(), "local", "peer").with_id(1u64);
		let resp = handle.send_request(&req).await.unwrap();
		assert_eq!(resp.result, Some(Value::from(42u64)));
		responder.await.unwrap();
	}

	#[tokio::test]
	async fn ping_answered_with_pong() {
		let (client, server) = tokio::io::duplex(4096);
		let (events, _events_rx) = unbounded_channel();
		let handle = start(strng::new("c1"), client, ConnShared::new(), events);

		let mut peer = fake_peer(server);
		peer.send(Frame::ping()).await.unwrap();
		let reply = peer.next().await.unwrap().unwrap();
		assert_eq!(reply.frame_type, FrameType::Pong);
		assert!(handle.is_open());
	}

	#[tokio::test]
	async fn response_split_across_chunks_surfaces_once() {
		use tokio::io::AsyncWriteExt;

		let (client, server) = tokio::io::duplex(4096);
		let (events, _events_rx) = unbounded_channel();
		let shared = ConnShared::new();
		let handle = start(strng::new("c1"), client, shared, events);

		let (mut read_half, mut write_half) = tokio::io::split(server);
		let reader = tokio::spawn(async move {
			// Drain the outgoing request so the write side does not back up.
			use tokio::io::AsyncReadExt;
			let mut buf = [0u8; 1024];
			let _ = read_half.read(&mut buf).await;
		});

		let req = A2aMessage::request("m", Value::object(), "local", "peer").with_id("req-1");
		let resp = A2aMessage::response_to(&req, Value::from(7u64), "peer");
		let mut encoded = bytes::BytesMut::new();
		FrameCodec::default()
			.encode(Frame::response(resp.to_bytes().unwrap()), &mut encoded)
			.unwrap();

		let send = handle.send_request(&req);
		tokio::pin!(send);

		// Header plus three payload bytes first; no response may surface yet.
		write_half.write_all(&encoded[..HEADER_LEN + 3]).await.unwrap();
		write_half.flush().await.unwrap();
		tokio::select! {
			_ = &mut send => panic!("partial frame must not complete the request"),
			_ = tokio::time::sleep(Duration::from_millis(50)) => {},
		}

		write_half.write_all(&encoded[HEADER_LEN + 3..]).await.unwrap();
		write_half.flush().await.unwrap();
		let got = send.await.unwrap();
		assert_eq!(got.id, Some(RequestId::from("req-1")));
		reader.await.unwrap();
	}

	#[tokio::test]
	async fn peer_close_reports_event() {
		let (client, server) = tokio::io::duplex(4096);
		let (events, mut events_rx) = unbounded_channel();
		let handle = start(strng::new("c1"), client, ConnShared::new(), events);
		drop(server);
		let event = events_rx.recv().await.unwrap();
		match event {
			ConnEvent::Closed { conn, error } => {
				assert_eq!(conn, strng::new("c1"));
				assert!(error.is_none());
			},
		}
		assert!(!handle.is_open());
	}

	#[tokio::test]
	async fn unknown_response_id_discarded() {
		let (client, server) = tokio::io::duplex(4096);
		let (events, _events_rx) = unbounded_channel();
		let shared = ConnShared::new();
		let _handle = start(strng::new("c1"), client, shared.clone(), events);

		let mut peer = fake_peer(server);
		let req = A2aMessage::request("m", Value::object(), "x", "y").with_id("nobody-waiting");
		let resp = A2aMessage::response_to(&req, Value::Null, "peer");
		peer
			.send(Frame::response(resp.to_bytes().unwrap()))
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_millis(30)).await;
		// The stray response is counted but completes nothing.
		assert_eq!(shared.stats.messages_received.load(Ordering::Relaxed), 1);
		assert_eq!(shared.listeners.pending(), 0);
	}
}
