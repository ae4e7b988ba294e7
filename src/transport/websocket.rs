//! WebSocket transport: one JSON-RPC message per text frame over a
//! tokio-tungstenite client connection.

use std::sync::atomic::{AtomicBool, Ordering};

use a2a_wire::{A2aError, A2aMessage};
use async_trait::async_trait;
use fabric_core::prelude::*;
use futures::{SinkExt, StreamExt};
use http::header::AUTHORIZATION;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{Connector, connect_async_tls_with_config};
use tokio_util::sync::CancellationToken;

use super::conn::{ConnEvent, ConnShared, EventSender, Listeners, ProtocolHandle};
use crate::config::PeerConfig;

pub(crate) struct WsHandle {
	writer: mpsc::Sender<Message>,
	shared: Arc<ConnShared>,
	open: Arc<AtomicBool>,
	stop: CancellationToken,
}

pub(crate) fn peer_url(config: &PeerConfig) -> String {
	let scheme = if config.tls.is_some() { "wss" } else { "ws" };
	format!(
		"{}://{}:{}{}",
		scheme,
		config.host,
		config.port_or_default(),
		config.path_or_default()
	)
}

pub(crate) async fn connect(
	conn_id: Strng,
	config: &PeerConfig,
	shared: Arc<ConnShared>,
	events: EventSender,
) -> Result<Arc<WsHandle>, A2aError> {
	let url = peer_url(config);
	let mut request = url
		.as_str()
		.into_client_request()
		.map_err(|e| A2aError::routing(format!("invalid websocket url {url}: {e}")))?;
	if let Some(token) = config.auth.bearer() {
		let value = format!("Bearer {token}")
			.parse()
			.map_err(|_| A2aError::authentication("bearer token is not a valid header value"))?;
		request.headers_mut().insert(AUTHORIZATION, value);
	}

	let connector = match &config.tls {
		Some(tls) => Some(Connector::Rustls(super::tls::client_config(tls, false)?)),
		None => None,
	};

	let connect_timeout = config.connect_timeout.unwrap_or(Duration::from_secs(10));
	let (stream, _response) = tokio::time::timeout(
		connect_timeout,
		connect_async_tls_with_config(request, None, false, connector),
	)
	.await
	.map_err(|_| A2aError::timeout(format!("websocket connect to {url} timed out")))?
	.map_err(|e| A2aError::routing(format!("websocket connect to {url}: {e}")))?;

	let (mut sink, mut source) = stream.split();
	let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(64);
	let open = Arc::new(AtomicBool::new(true));
	let stop = CancellationToken::new();

	let write_open = open.clone();
	let write_stop = stop.clone();
	let write_shared = shared.clone();
	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = write_stop.cancelled() => {
					let _ = sink.close().await;
					break;
				},
				msg = writer_rx.recv() => {
					let Some(msg) = msg else { break };
					let size = message_size(&msg) as u64;
					if let Err(e) = sink.send(msg).await {
						debug!("websocket write failed: {e}");
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
				msg = source.next() => match msg {
					Some(Ok(msg)) => {
						read_shared.touch();
						read_shared
							.stats
							.bytes_received
							.fetch_add(message_size(&msg) as u64, Ordering::Relaxed);
						match msg {
							// The server's ping elicits an immediate pong.
							Message::Ping(data) => {
								let _ = pong_tx.send(Message::Pong(data)).await;
							},
							Message::Pong(_) => {},
							Message::Text(text) => dispatch(&read_shared, text.as_bytes()),
							Message::Binary(data) => dispatch(&read_shared, &data),
							Message::Close(_) => break None,
							Message::Frame(_) => {},
						}
					},
					Some(Err(e)) => {
						read_shared.stats.errors.fetch_add(1, Ordering::Relaxed);
						break Some(A2aError::routing(format!("websocket error: {e}")));
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

	Ok(Arc::new(WsHandle {
		writer: writer_tx,
		shared,
		open,
		stop,
	}))
}

fn dispatch(shared: &Arc<ConnShared>, payload: &[u8]) {
	match A2aMessage::from_slice(payload) {
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
			warn!("undecodable websocket frame: {e}");
		},
	}
}

fn message_size(msg: &Message) -> usize {
	match msg {
		Message::Text(t) => t.len(),
		Message::Binary(b) | Message::Ping(b) | Message::Pong(b) => b.len(),
		_ => 0,
	}
}

impl WsHandle {
	async fn write(&self, msg: Message) -> Result<(), A2aError> {
		self
			.writer
			.send(msg)
			.await
			.map_err(|_| A2aError::routing("connection is closed"))
	}
}

#[async_trait]
impl ProtocolHandle for WsHandle {
	async fn send_request(&self, msg: &A2aMessage) -> Result<A2aMessage, A2aError> {
		let id = msg
			.id
			.clone()
			.ok_or_else(|| A2aError::internal("request has no id"))?;
		let text = serde_json::to_string(msg)?;
		let (_guard, rx) = Listeners::register(&self.shared, id);
		self.write(Message::text(text)).await?;
		self
			.shared
			.stats
			.messages_sent
			.fetch_add(1, Ordering::Relaxed);
		rx.await
			.map_err(|_| A2aError::routing("connection closed while awaiting response"))
	}

	async fn send_notification(&self, msg: &A2aMessage) -> Result<(), A2aError> {
		let text = serde_json::to_string(msg)?;
		self.write(Message::text(text)).await?;
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
	use crate::config::{AuthMode, ProtocolKind, TlsSettings};
	use fabric_core::strng;

	fn peer(tls: bool) -> PeerConfig {
		PeerConfig {
			peer: strng::new("agent-b"),
			protocol: ProtocolKind::Websocket,
			host: "example.com".to_string(),
			port: None,
			path: None,
			tls: tls.then(TlsSettings::default),
			auth: AuthMode::None,
			connect_timeout: None,
			request_timeout: None,
			keep_alive: false,
		}
	}

	#[test]
	fn url_building() {
		assert_eq!(peer_url(&peer(false)), "ws://example.com:80/a2a");
		assert_eq!(peer_url(&peer(true)), "wss://example.com:443/a2a");
		let mut custom = peer(false);
		custom.port = Some(9001);
		custom.path = Some("/agents".to_string());
		assert_eq!(peer_url(&custom), "ws://example.com:9001/agents");
	}
}
