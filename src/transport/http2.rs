//! HTTP/2 transport: one multiplexed h2 session per connection, one POST
//! stream per message.

use std::sync::atomic::{AtomicBool, Ordering};

use a2a_wire::{A2aError, A2aMessage};
use async_trait::async_trait;
use bytes::BytesMut;
use fabric_core::prelude::*;
use h2::client::SendRequest;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::conn::{ConnEvent, ConnShared, EventSender, ProtocolHandle};
use crate::config::PeerConfig;

pub(crate) struct H2Handle {
	send_req: SendRequest<Bytes>,
	uri: String,
	bearer: Option<String>,
	shared: Arc<ConnShared>,
	open: Arc<AtomicBool>,
	stop: CancellationToken,
}

/// Open the TCP (and optionally TLS) stream for an h2-based protocol.
pub(crate) async fn open_stream(
	config: &PeerConfig,
) -> Result<MaybeTls, A2aError> {
	let addr = format!("{}:{}", config.host, config.port_or_default());
	let connect_timeout = config.connect_timeout.unwrap_or(Duration::from_secs(10));
	let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
		.await
		.map_err(|_| A2aError::timeout(format!("connect to {addr} timed out")))?
		.map_err(|e| A2aError::routing(format!("connect to {addr}: {e}")))?;
	match &config.tls {
		Some(tls) => {
			let tls_config = super::tls::client_config(tls, true)?;
			let server_name = super::tls::server_name(&config.host)?;
			let connector = tokio_rustls::TlsConnector::from(tls_config);
			let stream = connector
				.connect(server_name, stream)
				.await
				.map_err(|e| A2aError::routing(format!("tls handshake with {addr}: {e}")))?;
			Ok(MaybeTls::Tls(Box::new(stream)))
		},
		None => Ok(MaybeTls::Plain(stream)),
	}
}

pub(crate) enum MaybeTls {
	Plain(TcpStream),
	Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Perform the h2 handshake and spawn the connection driver. The driver
/// reports session termination through the transport event channel.
pub(crate) async fn session(
	conn_id: Strng,
	stream: MaybeTls,
	events: EventSender,
	open: Arc<AtomicBool>,
	stop: CancellationToken,
) -> Result<SendRequest<Bytes>, A2aError> {
	match stream {
		MaybeTls::Plain(s) => handshake(conn_id, s, events, open, stop).await,
		MaybeTls::Tls(s) => handshake(conn_id, *s, events, open, stop).await,
	}
}

async fn handshake<S>(
	conn_id: Strng,
	stream: S,
	events: EventSender,
	open: Arc<AtomicBool>,
	stop: CancellationToken,
) -> Result<SendRequest<Bytes>, A2aError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let mut builder = h2::client::Builder::new();
	builder
		.initial_window_size(4 * 1024 * 1024)
		.initial_connection_window_size(16 * 1024 * 1024)
		.max_send_buffer_size(4 * 1024 * 1024)
		.enable_push(false);
	let (send_req, connection) = builder
		.handshake::<_, Bytes>(stream)
		.await
		.map_err(|e| A2aError::routing(format!("h2 handshake failed: {e}")))?;

	tokio::spawn(async move {
		tokio::select! {
			_ = stop.cancelled() => {},
			result = connection => {
				open.store(false, Ordering::Relaxed);
				let _ = events.send(ConnEvent::Closed {
					conn: conn_id,
					error: result
						.err()
						.map(|e| A2aError::routing(format!("h2 session ended: {e}"))),
				});
			},
		}
	});
	Ok(send_req)
}

pub(crate) async fn connect(
	conn_id: Strng,
	config: &PeerConfig,
	shared: Arc<ConnShared>,
	events: EventSender,
) -> Result<Arc<H2Handle>, A2aError> {
	let stream = open_stream(config).await?;
	let open = Arc::new(AtomicBool::new(true));
	let stop = CancellationToken::new();
	let send_req = session(conn_id, stream, events, open.clone(), stop.clone()).await?;
	let scheme = if config.tls.is_some() { "https" } else { "http" };
	let uri = format!(
		"{}://{}:{}{}",
		scheme,
		config.host,
		config.port_or_default(),
		config.path_or_default()
	);
	Ok(Arc::new(H2Handle {
		send_req,
		uri,
		bearer: config.auth.bearer().map(str::to_string),
		shared,
		open,
		stop,
	}))
}

pub(crate) fn build_request(
	uri: &str,
	bearer: Option<&str>,
	len: usize,
) -> Result<http::Request<()>, A2aError> {
	let mut builder = http::Request::builder()
		.method(http::Method::POST)
		.uri(uri)
		.header(http::header::CONTENT_TYPE, "application/json")
		.header(http::header::CONTENT_LENGTH, len);
	if let Some(token) = bearer {
		builder = builder.header(http::header::AUTHORIZATION, format!("Bearer {token}"));
	}
	builder
		.body(())
		.map_err(|e| A2aError::internal(format!("building request: {e}")))
}

impl H2Handle {
	async fn dispatch(&self, payload: Bytes) -> Result<http::Response<h2::RecvStream>, A2aError> {
		let request = build_request(&self.uri, self.bearer.as_deref(), payload.len())?;
		let payload_len = payload.len() as u64;
		let mut send_req = self
			.send_req
			.clone()
			.ready()
			.await
			.map_err(|e| A2aError::routing(format!("h2 not ready: {e}")))?;
		let (response, mut stream) = send_req
			.send_request(request, false)
			.map_err(|e| A2aError::routing(format!("opening h2 stream: {e}")))?;
		stream
			.send_data(payload, true)
			.map_err(|e| A2aError::routing(format!("h2 write: {e}")))?;
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
			.map_err(|e| A2aError::routing(format!("h2 request failed: {e}")))?;
		let status = response.status();
		if status != http::StatusCode::OK {
			return Err(
				A2aError::routing(format!("h2 request returned status {status}"))
					.with_status(status.as_u16()),
			);
		}
		Ok(response)
	}
}

pub(crate) async fn read_body(
	shared: &Arc<ConnShared>,
	mut body: h2::RecvStream,
) -> Result<Bytes, A2aError> {
	read_body_ref(shared, &mut body).await
}

/// Collect a response body without consuming the stream, so callers can still
/// await trailers afterwards.
pub(crate) async fn read_body_ref(
	shared: &Arc<ConnShared>,
	body: &mut h2::RecvStream,
) -> Result<Bytes, A2aError> {
	let mut buf = BytesMut::new();
	while let Some(chunk) = body.data().await {
		let chunk = chunk.map_err(|e| A2aError::routing(format!("h2 read: {e}")))?;
		let _ = body.flow_control().release_capacity(chunk.len());
		shared
			.stats
			.bytes_received
			.fetch_add(chunk.len() as u64, Ordering::Relaxed);
		buf.extend_from_slice(&chunk);
	}
	shared.touch();
	Ok(buf.freeze())
}

#[async_trait]
impl ProtocolHandle for H2Handle {
	async fn send_request(&self, msg: &A2aMessage) -> Result<A2aMessage, A2aError> {
		let payload = msg.to_bytes()?;
		let response = self.dispatch(payload).await?;
		let body = read_body(&self.shared, response.into_body()).await?;
		self
			.shared
			.stats
			.messages_received
			.fetch_add(1, Ordering::Relaxed);
		A2aMessage::from_slice(&body)
	}

	async fn send_notification(&self, msg: &A2aMessage) -> Result<(), A2aError> {
		let payload = msg.to_bytes()?;
		let response = self.dispatch(payload).await?;
		// Notifications carry no response; drain whatever the peer sends back.
		let _ = read_body(&self.shared, response.into_body()).await?;
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
	use crate::config::{AuthMode, ProtocolKind};
	use fabric_core::strng;

	#[test]
	fn request_headers() {
		let req = build_request("http://example.com:8080/a2a", Some("tok"), 12).unwrap();
		assert_eq!(req.method(), http::Method::POST);
		assert_eq!(req.uri().path(), "/a2a");
		assert_eq!(
			req.headers().get(http::header::CONTENT_TYPE).unwrap(),
			"application/json"
		);
		assert_eq!(
			req.headers().get(http::header::CONTENT_LENGTH).unwrap(),
			"12"
		);
		assert_eq!(
			req.headers().get(http::header::AUTHORIZATION).unwrap(),
			"Bearer tok"
		);

		let plain = build_request("http://example.com/a2a", None, 0).unwrap();
		assert!(plain.headers().get(http::header::AUTHORIZATION).is_none());
	}

	#[test]
	fn uri_shape() {
		let config = PeerConfig {
			peer: strng::new("agent-b"),
			protocol: ProtocolKind::Http2,
			host: "example.com".to_string(),
			port: Some(8443),
			path: None,
			tls: None,
			auth: AuthMode::Token {
				token: "t".to_string(),
			},
			connect_timeout: None,
			request_timeout: None,
			keep_alive: false,
		};
		assert_eq!(config.path_or_default(), "/a2a");
		assert_eq!(config.port_or_default(), 8443);
	}
}
