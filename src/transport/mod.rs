//! Multi-protocol transport layer: per-peer connection pooling over
//! WebSocket, HTTP/2, gRPC and framed TCP, JSON-RPC message framing,
//! send retries and reconnection with backoff.

pub mod conn;
mod grpc;
mod http2;
pub mod metrics;
mod tcp;
mod tls;
mod websocket;

use std::collections::{HashMap, HashSet};
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

use a2a_wire::{A2aError, A2aMessage, now_ms};
use fabric_core::prelude::*;
use prometheus_client::registry::Registry;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub use conn::{ConnState, ConnStats, Connection};
use conn::{ConnEvent, ConnShared, ProtocolHandle};
use metrics::{ConnLabel, ErrorLabel, Metrics};

use crate::config::{PeerConfig, ProtocolKind, TransportSettings, UnknownProtocolPolicy};
use crate::lifecycle::LifecycleSink;

/// Primary map plus a peer index. Both are kept consistent under one lock;
/// iteration always snapshots so the lock is never held across awaits.
#[derive(Default)]
struct Pool {
	by_id: HashMap<Strng, Arc<Connection>>,
	by_peer: HashMap<Strng, HashSet<Strng>>,
}

impl Pool {
	fn insert(&mut self, conn: Arc<Connection>) {
		self
			.by_peer
			.entry(conn.peer.clone())
			.or_default()
			.insert(conn.id.clone());
		self.by_id.insert(conn.id.clone(), conn);
	}

	fn remove(&mut self, id: &Strng) -> Option<Arc<Connection>> {
		let conn = self.by_id.remove(id)?;
		if let Some(ids) = self.by_peer.get_mut(&conn.peer) {
			ids.remove(id);
			if ids.is_empty() {
				self.by_peer.remove(&conn.peer);
			}
		}
		Some(conn)
	}

	fn get(&self, id: &Strng) -> Option<Arc<Connection>> {
		self.by_id.get(id).cloned()
	}

	fn total(&self) -> usize {
		self.by_id.len()
	}

	fn peer_count(&self, peer: &Strng) -> usize {
		self.by_peer.get(peer).map(|s| s.len()).unwrap_or(0)
	}

	fn snapshot(&self) -> Vec<Arc<Connection>> {
		self.by_id.values().cloned().collect()
	}

	fn peer_conns(&self, peer: &Strng) -> Vec<Arc<Connection>> {
		self
			.by_peer
			.get(peer)
			.map(|ids| {
				ids
					.iter()
					.filter_map(|id| self.by_id.get(id).cloned())
					.collect()
			})
			.unwrap_or_default()
	}

	#[cfg(test)]
	fn consistent(&self) -> bool {
		let indexed: usize = self.by_peer.values().map(|s| s.len()).sum();
		indexed == self.by_id.len()
			&& self
				.by_peer
				.iter()
				.all(|(peer, ids)| {
					ids
						.iter()
						.all(|id| self.by_id.get(id).is_some_and(|c| &c.peer == peer))
				})
	}
}

#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
	pub reconnecting: bool,
	pub attempts: u32,
	pub last_attempt_ms: u64,
}

/// Aggregated view over the pool, returned by [`Transport::metrics_snapshot`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportSnapshot {
	pub total_connections: usize,
	pub active_connections: usize,
	pub bytes_sent: u64,
	pub bytes_received: u64,
	pub messages_sent: u64,
	pub messages_received: u64,
	pub errors: u64,
	pub pending_requests: usize,
}

pub struct Transport {
	settings: TransportSettings,
	pool: Mutex<Pool>,
	reconnects: Mutex<HashMap<Strng, ReconnectState>>,
	metrics: Arc<Metrics>,
	sink: Arc<dyn LifecycleSink>,
	events_tx: mpsc::UnboundedSender<ConnEvent>,
	shutdown: CancellationToken,
	conn_seq: AtomicU64,
	msg_seq: AtomicU64,
}

impl Transport {
	pub fn new(
		settings: TransportSettings,
		registry: &mut Registry,
		sink: Arc<dyn LifecycleSink>,
	) -> Arc<Transport> {
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let transport = Arc::new(Transport {
			settings,
			pool: Mutex::new(Pool::default()),
			reconnects: Mutex::new(HashMap::new()),
			metrics: Arc::new(Metrics::new(registry.sub_registry_with_prefix("transport"))),
			sink,
			events_tx,
			shutdown: CancellationToken::new(),
			conn_seq: AtomicU64::new(0),
			msg_seq: AtomicU64::new(0),
		});
		tokio::spawn(Self::event_loop(Arc::downgrade(&transport), events_rx));
		tokio::spawn(Self::reap_loop(Arc::downgrade(&transport)));
		transport
	}

	/// Establish connections to every configured peer. Individual failures are
	/// logged and do not abort initialization; unreachable peers can still be
	/// connected explicitly later.
	pub async fn initialize(self: &Arc<Self>) -> usize {
		let mut established = 0;
		for peer in self.settings.peers.clone() {
			match self.connect(&peer).await {
				Ok(conn) => {
					debug!(conn=%conn.id, peer=%conn.peer, "connected");
					established += 1;
				},
				Err(e) => {
					warn!(peer=%peer.peer, "failed to connect: {e}");
				},
			}
		}
		established
	}

	#[instrument(level = "debug", skip_all, fields(peer=%config.peer))]
	pub async fn connect(
		self: &Arc<Self>,
		config: &PeerConfig,
	) -> Result<Arc<Connection>, A2aError> {
		if self.shutdown.is_cancelled() {
			return Err(A2aError::unavailable("transport is shut down").with_component("transport"));
		}
		self.check_capacity(&config.peer)?;

		let seq = self.conn_seq.fetch_add(1, Ordering::Relaxed);
		let conn_id = strng::format!("{}-{}", config.peer, seq);
		let shared = ConnShared::new();
		let (handle, protocol) = self
			.establish(conn_id.clone(), config, shared.clone())
			.await?;

		let conn = Connection::new(
			conn_id.clone(),
			config.peer.clone(),
			protocol,
			Arc::new(config.clone()),
			shared,
			handle,
		);
		let inserted = {
			let mut pool = self.pool.lock().unwrap();
			// The capacity check races with concurrent connects; re-check before insert.
			if pool.total() >= self.settings.max_total
				|| pool.peer_count(&config.peer) >= self.settings.max_per_peer
			{
				false
			} else {
				pool.insert(conn.clone());
				true
			}
		};
		if !inserted {
			conn.handle().await.close().await;
			return Err(
				A2aError::resource_exhausted("connection pool is full").with_component("transport"),
			);
		}
		let label = ConnLabel {
			peer: conn.peer.clone().into(),
			protocol: conn.protocol.label().into(),
		};
		self.metrics.connections_established.get_or_create(&label).inc();
		self.metrics.connections_active.inc();
		self.sink.connection_established(&conn.id, &conn.peer);
		Ok(conn)
	}

	fn check_capacity(&self, peer: &Strng) -> Result<(), A2aError> {
		let pool = self.pool.lock().unwrap();
		if pool.total() >= self.settings.max_total {
			return Err(
				A2aError::resource_exhausted(format!(
					"connection pool is at capacity ({})",
					self.settings.max_total
				))
				.with_component("transport"),
			);
		}
		if pool.peer_count(peer) >= self.settings.max_per_peer {
			return Err(
				A2aError::resource_exhausted(format!(
					"peer {peer} is at its connection cap ({})",
					self.settings.max_per_peer
				))
				.with_component("transport"),
			);
		}
		Ok(())
	}

	/// Protocol-dispatched establishment. The unknown-protocol policy is a
	/// configured installation property, not a per-call decision.
	async fn establish(
		&self,
		conn_id: Strng,
		config: &PeerConfig,
		shared: Arc<ConnShared>,
	) -> Result<(Arc<dyn ProtocolHandle>, ProtocolKind), A2aError> {
		let protocol = match &config.protocol {
			ProtocolKind::Unknown(name) => match self.settings.unknown_protocol {
				UnknownProtocolPolicy::Refuse => {
					return Err(
						A2aError::protocol(format!("unrecognized protocol {name:?}"))
							.with_component("transport"),
					);
				},
				UnknownProtocolPolicy::FallbackHttp2 => {
					warn!(peer=%config.peer, protocol=%name, "unrecognized protocol, falling back to http2");
					ProtocolKind::Http2
				},
			},
			p => p.clone(),
		};
		let events = self.events_tx.clone();
		let handle: Arc<dyn ProtocolHandle> = match protocol {
			ProtocolKind::Websocket => websocket::connect(conn_id, config, shared, events).await?,
			ProtocolKind::Http2 => http2::connect(conn_id, config, shared, events).await?,
			ProtocolKind::Grpc => grpc::connect(conn_id, config, shared, events).await?,
			ProtocolKind::FramedTcp => tcp::connect(conn_id, config, shared, events).await?,
			ProtocolKind::Unknown(_) => unreachable!("resolved above"),
		};
		Ok((handle, protocol))
	}

	pub async fn disconnect(&self, conn_id: &Strng) {
		let removed = self.pool.lock().unwrap().remove(conn_id);
		let Some(conn) = removed else {
			debug!(conn=%conn_id, "disconnect of unknown connection ignored");
			return;
		};
		self.close_conn(&conn).await;
	}

	async fn close_conn(&self, conn: &Arc<Connection>) {
		conn.set_connected(false);
		conn.set_state(ConnState::Closed);
		conn.handle().await.close().await;
		self.reconnects.lock().unwrap().remove(&conn.id);
		let label = ConnLabel {
			peer: conn.peer.clone().into(),
			protocol: conn.protocol.label().into(),
		};
		self.metrics.connections_closed.get_or_create(&label).inc();
		self.metrics.connections_active.dec();
		self.sink.connection_closed(&conn.id, &conn.peer);
	}

	fn get_live(&self, conn_id: &Strng) -> Result<Arc<Connection>, A2aError> {
		let conn = self
			.pool
			.lock()
			.unwrap()
			.get(conn_id)
			.ok_or_else(|| {
				A2aError::routing(format!("unknown connection {conn_id}")).with_component("transport")
			})?;
		if !conn.is_connected() {
			return Err(
				A2aError::routing(format!("connection {conn_id} is not connected"))
					.with_component("transport"),
			);
		}
		Ok(conn)
	}

	fn next_id(&self) -> u64 {
		self.msg_seq.fetch_add(1, Ordering::Relaxed)
	}

	#[instrument(level = "debug", skip_all, fields(conn=%conn_id))]
	pub async fn send_request(
		self: &Arc<Self>,
		conn_id: &Strng,
		mut msg: A2aMessage,
	) -> Result<A2aMessage, A2aError> {
		let conn = self.get_live(conn_id)?;
		if msg.id.is_none() {
			msg = msg.with_id(self.next_id());
		}
		msg.validate()?;
		self.send_on(conn, msg).await
	}

	/// The shared retrying send path. Retryable failures are retried with
	/// exponential backoff, reusing the connection while it stays healthy and
	/// dialing a fresh one to the same peer when it does not.
	async fn send_on(
		self: &Arc<Self>,
		mut conn: Arc<Connection>,
		msg: A2aMessage,
	) -> Result<A2aMessage, A2aError> {
		let timeout = conn
			.config
			.request_timeout
			.unwrap_or(self.settings.request_timeout);
		let mut attempt: u32 = 0;
		loop {
			attempt += 1;
			let handle = conn.handle().await;
			let err = match tokio::time::timeout(timeout, handle.send_request(&msg)).await {
				Ok(Ok(resp)) => {
					conn.shared.touch();
					self
						.metrics
						.messages_sent
						.get_or_create(&ConnLabel {
							peer: conn.peer.clone().into(),
							protocol: conn.protocol.label().into(),
						})
						.inc();
					return Ok(resp);
				},
				Ok(Err(e)) => e,
				// Dropping the send future tears the response listener down.
				Err(_) => A2aError::timeout(format!("request timed out after {timeout:?}")),
			};
			conn.stats().errors.fetch_add(1, Ordering::Relaxed);
			self
				.metrics
				.send_errors
				.get_or_create(&ErrorLabel {
					peer: conn.peer.clone().into(),
					error_type: strng::new(err.kind.as_str()).into(),
				})
				.inc();
			if !err.retryable() || attempt > self.settings.max_retries {
				return Err(err.with_component("transport"));
			}
			let delay = self.settings.retry_base_delay * 2u32.pow(attempt - 1);
			debug!(conn=%conn.id, attempt, ?delay, "retrying send after {err}");
			tokio::time::sleep(delay).await;
			if !conn.is_connected() || !conn.handle().await.is_open() {
				match self.connect(&conn.config).await {
					Ok(fresh) => conn = fresh,
					Err(e) => debug!("could not establish replacement connection: {e}"),
				}
			}
		}
	}

	pub async fn send_notification(
		self: &Arc<Self>,
		conn_id: &Strng,
		msg: A2aMessage,
	) -> Result<(), A2aError> {
		let conn = self.get_live(conn_id)?;
		msg.validate()?;
		let timeout = conn
			.config
			.request_timeout
			.unwrap_or(self.settings.request_timeout);
		let handle = conn.handle().await;
		match tokio::time::timeout(timeout, handle.send_notification(&msg)).await {
			Ok(Ok(())) => {
				conn.shared.touch();
				Ok(())
			},
			Ok(Err(e)) => Err(e.with_component("transport")),
			Err(_) => {
				Err(A2aError::timeout(format!("notification timed out after {timeout:?}"))
					.with_component("transport"))
			},
		}
	}

	/// Fan a message out to every live connection not in the exclude set, in
	/// parallel. Partial failure never raises; failures are logged and counted.
	/// Response ordering is unspecified.
	pub async fn broadcast(
		self: &Arc<Self>,
		mut msg: A2aMessage,
		exclude: &[Strng],
	) -> Vec<A2aMessage> {
		if msg.id.is_none() {
			msg = msg.with_id(self.next_id());
		}
		let (targets, offline): (Vec<Arc<Connection>>, Vec<Arc<Connection>>) = {
			let pool = self.pool.lock().unwrap();
			pool
				.snapshot()
				.into_iter()
				.filter(|c| !exclude.contains(&c.id))
				.partition(|c| c.is_connected())
		};
		for conn in &offline {
			self.metrics.broadcast_failures.inc();
			debug!(conn=%conn.id, peer=%conn.peer, "skipping disconnected connection in broadcast");
		}
		let sends = targets.iter().map(|conn| {
			let mut m = msg.clone();
			m.to = conn.peer.to_string();
			let conn = conn.clone();
			async move { (conn.id.clone(), self.send_on(conn, m).await) }
		});
		let mut responses = Vec::new();
		for (conn_id, result) in futures::future::join_all(sends).await {
			match result {
				Ok(resp) => responses.push(resp),
				Err(e) => {
					self.metrics.broadcast_failures.inc();
					warn!(conn=%conn_id, "broadcast send failed: {e}");
				},
			}
		}
		responses
	}

	pub fn connections_by_peer(&self, peer: &Strng) -> Vec<Arc<Connection>> {
		self.pool.lock().unwrap().peer_conns(peer)
	}

	pub fn connection(&self, conn_id: &Strng) -> Option<Arc<Connection>> {
		self.pool.lock().unwrap().get(conn_id)
	}

	pub fn reconnect_state(&self, conn_id: &Strng) -> Option<ReconnectState> {
		self.reconnects.lock().unwrap().get(conn_id).cloned()
	}

	pub fn metrics_snapshot(&self) -> TransportSnapshot {
		let conns = self.pool.lock().unwrap().snapshot();
		let mut snap = TransportSnapshot {
			total_connections: conns.len(),
			..Default::default()
		};
		for conn in conns {
			if conn.is_connected() {
				snap.active_connections += 1;
			}
			let stats = conn.stats();
			snap.bytes_sent += stats.bytes_sent.load(Ordering::Relaxed);
			snap.bytes_received += stats.bytes_received.load(Ordering::Relaxed);
			snap.messages_sent += stats.messages_sent.load(Ordering::Relaxed);
			snap.messages_received += stats.messages_received.load(Ordering::Relaxed);
			snap.errors += stats.errors.load(Ordering::Relaxed);
			snap.pending_requests += conn.shared.listeners.pending();
		}
		snap
	}

	/// Close everything. Awaits all close operations and never raises.
	pub async fn shutdown(&self) {
		self.shutdown.cancel();
		let conns = {
			let mut pool = self.pool.lock().unwrap();
			let conns = pool.snapshot();
			*pool = Pool::default();
			conns
		};
		for conn in conns {
			self.close_conn(&conn).await;
		}
	}

	async fn event_loop(
		this: Weak<Transport>,
		mut events: mpsc::UnboundedReceiver<ConnEvent>,
	) {
		while let Some(event) = events.recv().await {
			let Some(transport) = this.upgrade() else {
				return;
			};
			if transport.shutdown.is_cancelled() {
				return;
			}
			match event {
				ConnEvent::Closed { conn, error } => transport.on_closed(&conn, error),
			}
		}
	}

	fn on_closed(self: &Arc<Self>, conn_id: &Strng, error: Option<A2aError>) {
		let Some(conn) = self.pool.lock().unwrap().get(conn_id) else {
			return;
		};
		if conn.state() != ConnState::Connected {
			// Stale close from a handle already replaced or being replaced.
			return;
		}
		if let Some(err) = &error {
			self.sink.connection_error(&conn.id, &conn.peer, err);
		}
		let reconnectable = error.as_ref().map(|e| e.retryable()).unwrap_or(true);
		if reconnectable && self.settings.reconnect.max_attempts > 0 {
			conn.set_connected(false);
			conn.set_state(ConnState::Reconnecting);
			self.reconnects.lock().unwrap().insert(
				conn.id.clone(),
				ReconnectState {
					reconnecting: true,
					..Default::default()
				},
			);
			tokio::spawn(Self::reconnect_loop(Arc::downgrade(self), conn));
		} else {
			let this = self.clone();
			let id = conn.id.clone();
			tokio::spawn(async move {
				this.disconnect(&id).await;
			});
		}
	}

	/// Re-establish a dropped connection under its existing id, with capped
	/// exponential backoff. On success the fresh handle replaces the old one so
	/// outstanding callers observe continuity; after the attempt cap the
	/// connection is evicted and the peer is unreachable until the next
	/// explicit connect.
	async fn reconnect_loop(this: Weak<Transport>, conn: Arc<Connection>) {
		let mut attempts: u32 = 0;
		loop {
			let Some(transport) = this.upgrade() else { return };
			if transport.shutdown.is_cancelled() {
				return;
			}
			attempts += 1;
			let rc = &transport.settings.reconnect;
			let exp = rc.base_delay.as_millis() as f64 * rc.multiplier.powi(attempts as i32 - 1);
			let delay = Duration::from_millis(exp as u64).min(rc.max_delay);
			// Jitter up to 10% so a flapping peer does not see synchronized dials.
			let jitter = Duration::from_millis(if delay.as_millis() >= 10 {
				rand::rng().random_range(0..=(delay.as_millis() / 10) as u64)
			} else {
				0
			});
			let delay = delay + jitter;
			if let Some(state) = transport.reconnects.lock().unwrap().get_mut(&conn.id) {
				state.attempts = attempts;
				state.last_attempt_ms = now_ms();
			}
			let max_attempts = rc.max_attempts;
			drop(transport);
			tokio::time::sleep(delay).await;

			let Some(transport) = this.upgrade() else { return };
			if transport.shutdown.is_cancelled() {
				return;
			}
			match transport
				.establish(conn.id.clone(), &conn.config, conn.shared.clone())
				.await
			{
				Ok((handle, _)) => {
					conn.replace_handle(handle).await;
					transport.reconnects.lock().unwrap().remove(&conn.id);
					transport
						.metrics
						.reconnects
						.get_or_create(&ConnLabel {
							peer: conn.peer.clone().into(),
							protocol: conn.protocol.label().into(),
						})
						.inc();
					info!(conn=%conn.id, peer=%conn.peer, attempts, "reconnected");
					return;
				},
				Err(e) => {
					warn!(conn=%conn.id, attempts, "reconnect attempt failed: {e}");
					if attempts >= max_attempts {
						transport.disconnect(&conn.id).await;
						return;
					}
				},
			}
		}
	}

	/// Periodically disconnect idle or dead connections.
	async fn reap_loop(this: Weak<Transport>) {
		let interval = {
			let Some(transport) = this.upgrade() else { return };
			transport.settings.cleanup_interval
		};
		loop {
			tokio::time::sleep(interval).await;
			let Some(transport) = this.upgrade() else { return };
			if transport.shutdown.is_cancelled() {
				return;
			}
			let now = now_ms();
			let stale: Vec<Arc<Connection>> = {
				let pool = transport.pool.lock().unwrap();
				pool
					.snapshot()
					.into_iter()
					.filter(|c| {
						// Reconnecting connections are mid-transition; the reconnect loop
						// either restores them or evicts them itself.
						c.state() != ConnState::Reconnecting
							&& (!c.is_connected() || c.idle_for(now) > transport.settings.idle_ttl)
					})
					.collect()
			};
			for conn in stale {
				debug!(conn=%conn.id, "reaping idle connection");
				transport.disconnect(&conn.id).await;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{AuthMode, ReconnectConfig};
	use crate::lifecycle::{LifecycleEvent, NoopSink, RecordingSink};
	use a2a_wire::{Frame, FrameCodec, FrameType, Value};
	use futures::{SinkExt, StreamExt};
	use std::net::SocketAddr;
	use tokio::net::TcpListener;
	use tokio_util::codec::Framed;

	/// An in-process peer speaking the frame protocol. Echoes request params
	/// back as the result; drops the connection on a `close` notification;
	/// swallows `ignore` requests without answering.
	async fn spawn_frame_peer() -> SocketAddr {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			loop {
				let Ok((socket, _)) = listener.accept().await else {
					return;
				};
				tokio::spawn(async move {
					let mut framed = Framed::new(socket, FrameCodec::default());
					while let Some(Ok(frame)) = framed.next().await {
						match frame.frame_type {
							FrameType::Ping => {
								let _ = framed.send(Frame::pong()).await;
							},
							FrameType::Message | FrameType::Notification => {
								let Ok(req) = A2aMessage::from_slice(&frame.payload) else {
									continue;
								};
								match req.method.as_deref() {
									Some("close") => return,
									Some("ignore") => {},
									_ => {
										let result = req.params.clone().unwrap_or(Value::Null);
										let resp = A2aMessage::response_to(&req, result, "peer");
										let _ = framed
											.send(Frame::response(resp.to_bytes().unwrap()))
											.await;
									},
								}
							},
							_ => {},
						}
					}
				});
			}
		});
		addr
	}

	fn peer_config(name: &str, addr: SocketAddr) -> PeerConfig {
		PeerConfig {
			peer: strng::new(name),
			protocol: ProtocolKind::FramedTcp,
			host: addr.ip().to_string(),
			port: Some(addr.port()),
			path: None,
			tls: None,
			auth: AuthMode::None,
			connect_timeout: Some(Duration::from_secs(2)),
			request_timeout: None,
			keep_alive: false,
		}
	}

	fn test_settings() -> TransportSettings {
		TransportSettings {
			request_timeout: Duration::from_millis(500),
			max_retries: 0,
			retry_base_delay: Duration::from_millis(10),
			reconnect: ReconnectConfig {
				max_attempts: 3,
				base_delay: Duration::from_millis(30),
				multiplier: 2.0,
				max_delay: Duration::from_secs(30),
			},
			..Default::default()
		}
	}

	fn transport_with(settings: TransportSettings, sink: Arc<dyn LifecycleSink>) -> Arc<Transport> {
		let mut registry = Registry::default();
		Transport::new(settings, &mut registry, sink)
	}

	async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
		let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
		while !check() {
			if tokio::time::Instant::now() > deadline {
				panic!("timed out waiting for {what}");
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
	}

	#[tokio::test]
	async fn request_roundtrip_and_pool_consistency() {
		let addr = spawn_frame_peer().await;
		let transport = transport_with(test_settings(), Arc::new(NoopSink));
		let conn = transport.connect(&peer_config("agent-b", addr)).await.unwrap();

		let params: Value = [("a".to_string(), Value::from(2u64))].into_iter().collect();
		let req = A2aMessage::request("echo", params.clone(), "local", "agent-b");
		let resp = transport.send_request(&conn.id, req).await.unwrap();
		assert_eq!(resp.result, Some(params));

		assert!(transport.pool.lock().unwrap().consistent());
		let snap = transport.metrics_snapshot();
		assert_eq!(snap.total_connections, 1);
		assert_eq!(snap.active_connections, 1);
		assert_eq!(snap.messages_sent, 1);
		assert_eq!(snap.messages_received, 1);
		assert_eq!(snap.pending_requests, 0);
		transport.shutdown().await;
	}

	#[tokio::test]
	async fn per_peer_cap_rejects() {
		let addr = spawn_frame_peer().await;
		let mut settings = test_settings();
		settings.max_per_peer = 1;
		let transport = transport_with(settings, Arc::new(NoopSink));
		let config = peer_config("agent-b", addr);
		transport.connect(&config).await.unwrap();
		let err = transport.connect(&config).await.unwrap_err();
		assert_eq!(err.kind, a2a_wire::ErrorKind::ResourceExhausted);
		transport.shutdown().await;
	}

	#[tokio::test]
	async fn total_cap_rejects() {
		let addr = spawn_frame_peer().await;
		let mut settings = test_settings();
		settings.max_total = 2;
		let transport = transport_with(settings, Arc::new(NoopSink));
		transport.connect(&peer_config("p1", addr)).await.unwrap();
		transport.connect(&peer_config("p2", addr)).await.unwrap();
		let err = transport.connect(&peer_config("p3", addr)).await.unwrap_err();
		assert_eq!(err.kind, a2a_wire::ErrorKind::ResourceExhausted);
		transport.shutdown().await;
	}

	#[tokio::test]
	async fn unknown_connection_is_routing_error() {
		let transport = transport_with(test_settings(), Arc::new(NoopSink));
		let err = transport
			.send_request(
				&strng::new("nope-0"),
				A2aMessage::request("m", Value::object(), "a", "b"),
			)
			.await
			.unwrap_err();
		assert_eq!(err.kind, a2a_wire::ErrorKind::Routing);
	}

	#[tokio::test]
	async fn disconnected_connection_is_routing_error() {
		let addr = spawn_frame_peer().await;
		let transport = transport_with(test_settings(), Arc::new(NoopSink));
		let conn = transport.connect(&peer_config("agent-b", addr)).await.unwrap();
		conn.set_connected(false);
		let err = transport
			.send_request(&conn.id, A2aMessage::request("m", Value::object(), "a", "b"))
			.await
			.unwrap_err();
		assert_eq!(err.kind, a2a_wire::ErrorKind::Routing);
		transport.shutdown().await;
	}

	#[tokio::test]
	async fn broadcast_empty_pool_returns_empty() {
		let transport = transport_with(test_settings(), Arc::new(NoopSink));
		let out = transport
			.broadcast(A2aMessage::request("ping", Value::object(), "local", "broadcast"), &[])
			.await;
		assert!(out.is_empty());
	}

	#[tokio::test]
	async fn broadcast_skips_offline_peer() {
		let addr = spawn_frame_peer().await;
		let transport = transport_with(test_settings(), Arc::new(NoopSink));
		transport.connect(&peer_config("p1", addr)).await.unwrap();
		let c2 = transport.connect(&peer_config("p2", addr)).await.unwrap();
		transport.connect(&peer_config("p3", addr)).await.unwrap();
		c2.set_connected(false);

		let out = transport
			.broadcast(A2aMessage::request("ping", Value::object(), "local", "broadcast"), &[])
			.await;
		assert_eq!(out.len(), 2);
		assert_eq!(transport.metrics.broadcast_failures.get(), 1);
		transport.shutdown().await;
	}

	#[tokio::test]
	async fn broadcast_respects_exclude_set() {
		let addr = spawn_frame_peer().await;
		let transport = transport_with(test_settings(), Arc::new(NoopSink));
		let c1 = transport.connect(&peer_config("p1", addr)).await.unwrap();
		transport.connect(&peer_config("p2", addr)).await.unwrap();
		let out = transport
			.broadcast(
				A2aMessage::request("ping", Value::object(), "local", "broadcast"),
				&[c1.id.clone()],
			)
			.await;
		assert_eq!(out.len(), 1);
		transport.shutdown().await;
	}

	#[tokio::test]
	async fn request_timeout_tears_down_listener() {
		let addr = spawn_frame_peer().await;
		let mut settings = test_settings();
		settings.request_timeout = Duration::from_millis(100);
		let transport = transport_with(settings, Arc::new(NoopSink));
		let conn = transport.connect(&peer_config("agent-b", addr)).await.unwrap();
		let err = transport
			.send_request(&conn.id, A2aMessage::request("ignore", Value::object(), "a", "b"))
			.await
			.unwrap_err();
		assert_eq!(err.kind, a2a_wire::ErrorKind::Timeout);
		assert!(err.retryable());
		assert_eq!(conn.shared.listeners.pending(), 0);
		transport.shutdown().await;
	}

	#[tokio::test]
	async fn reconnects_under_same_id_after_peer_close() {
		let addr = spawn_frame_peer().await;
		let sink = Arc::new(RecordingSink::new());
		let transport = transport_with(test_settings(), sink.clone());
		let conn = transport.connect(&peer_config("agent-b", addr)).await.unwrap();
		let conn_id = conn.id.clone();

		transport
			.send_notification(
				&conn.id,
				A2aMessage::notification("close", Value::object(), "local", "agent-b"),
			)
			.await
			.unwrap();

		// The peer drops the socket; reconnection replaces the handle in place.
		eventually("reconnect", || {
			transport
				.connection(&conn_id)
				.is_some_and(|c| c.state() == ConnState::Connected && c.is_connected())
		})
		.await;

		// No attempt count may ever exceed the cap.
		assert!(
			transport
				.reconnect_state(&conn_id)
				.map(|s| s.attempts <= transport.settings.reconnect.max_attempts)
				.unwrap_or(true)
		);

		// The replacement connection answers requests under the original id.
		let resp = transport
			.send_request(
				&conn_id,
				A2aMessage::request("echo", Value::from(1u64), "local", "agent-b"),
			)
			.await
			.unwrap();
		assert!(resp.result.is_some());
		assert_eq!(transport.metrics_snapshot().total_connections, 1);
		assert!(
			sink
				.events()
				.iter()
				.any(|e| matches!(e, LifecycleEvent::ConnectionEstablished { .. }))
		);
		transport.shutdown().await;
	}

	#[tokio::test]
	async fn idle_reaper_removes_stale_connections() {
		let addr = spawn_frame_peer().await;
		let mut settings = test_settings();
		settings.idle_ttl = Duration::from_millis(50);
		settings.cleanup_interval = Duration::from_millis(60);
		settings.reconnect.max_attempts = 0;
		let transport = transport_with(settings, Arc::new(NoopSink));
		transport.connect(&peer_config("agent-b", addr)).await.unwrap();
		eventually("reap", || {
			transport.metrics_snapshot().total_connections == 0
		})
		.await;
		transport.shutdown().await;
	}

	#[tokio::test]
	async fn unknown_protocol_policy() {
		let addr = spawn_frame_peer().await;
		let transport = transport_with(test_settings(), Arc::new(NoopSink));
		let mut config = peer_config("agent-b", addr);
		config.protocol = ProtocolKind::Unknown(strng::new("carrier-pigeon"));
		let err = transport.connect(&config).await.unwrap_err();
		assert_eq!(err.kind, a2a_wire::ErrorKind::Protocol);
	}

	#[tokio::test]
	async fn shutdown_closes_everything() {
		let addr = spawn_frame_peer().await;
		let sink = Arc::new(RecordingSink::new());
		let transport = transport_with(test_settings(), sink.clone());
		transport.connect(&peer_config("p1", addr)).await.unwrap();
		transport.connect(&peer_config("p2", addr)).await.unwrap();
		transport.shutdown().await;
		assert_eq!(transport.metrics_snapshot().total_connections, 0);
		let closed = sink
			.events()
			.iter()
			.filter(|e| matches!(e, LifecycleEvent::ConnectionClosed { .. }))
			.count();
		assert_eq!(closed, 2);
		let err = transport.connect(&peer_config("p3", addr)).await.unwrap_err();
		assert_eq!(err.kind, a2a_wire::ErrorKind::AgentUnavailable);
	}
}
