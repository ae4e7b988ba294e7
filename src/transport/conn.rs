use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use a2a_wire::{A2aError, A2aMessage, RequestId, now_ms};
use async_trait::async_trait;
use fabric_core::prelude::*;
use tokio::sync::oneshot;

use crate::config::{PeerConfig, ProtocolKind};

/// Connection lifecycle: `connecting → connected → (reconnecting ↔ connected)* → closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
	Connecting,
	Connected,
	Reconnecting,
	Closed,
}

/// Raised by protocol drivers when their connection dies.
#[derive(Debug)]
pub(crate) enum ConnEvent {
	Closed {
		conn: Strng,
		error: Option<A2aError>,
	},
}

pub(crate) type EventSender = tokio::sync::mpsc::UnboundedSender<ConnEvent>;

/// The protocol-specific half of a connection. Replaced wholesale on reconnect;
/// everything that must survive a reconnect lives in [`ConnShared`].
#[async_trait]
pub(crate) trait ProtocolHandle: Send + Sync {
	async fn send_request(&self, msg: &A2aMessage) -> Result<A2aMessage, A2aError>;
	async fn send_notification(&self, msg: &A2aMessage) -> Result<(), A2aError>;
	fn is_open(&self) -> bool;
	async fn close(&self);
}

#[derive(Default)]
pub struct ConnStats {
	pub bytes_sent: AtomicU64,
	pub bytes_received: AtomicU64,
	pub messages_sent: AtomicU64,
	pub messages_received: AtomicU64,
	pub errors: AtomicU64,
}

/// State shared between a [`Connection`] and its protocol drivers. Survives
/// handle replacement so outstanding response listeners observe continuity.
pub(crate) struct ConnShared {
	pub stats: ConnStats,
	last_activity: AtomicU64,
	pub listeners: Listeners,
}

impl ConnShared {
	pub fn new() -> Arc<ConnShared> {
		Arc::new(ConnShared {
			stats: ConnStats::default(),
			last_activity: AtomicU64::new(now_ms()),
			listeners: Listeners::default(),
		})
	}

	/// Bump the activity clock. Monotonically non-decreasing.
	pub fn touch(&self) {
		self.last_activity.fetch_max(now_ms(), Ordering::Relaxed);
	}

	pub fn last_activity(&self) -> u64 {
		self.last_activity.load(Ordering::Relaxed)
	}
}

/// Response listeners keyed by request id. The sender registers before writing;
/// the receive loop completes on arrival; unknown ids are discarded.
#[derive(Default)]
pub(crate) struct Listeners {
	map: Mutex<HashMap<RequestId, oneshot::Sender<A2aMessage>>>,
}

impl Listeners {
	pub fn register(
		shared: &Arc<ConnShared>,
		id: RequestId,
	) -> (ListenerGuard, oneshot::Receiver<A2aMessage>) {
		let (tx, rx) = oneshot::channel();
		shared
			.listeners
			.map
			.lock()
			.unwrap()
			.insert(id.clone(), tx);
		(
			ListenerGuard {
				id,
				shared: shared.clone(),
			},
			rx,
		)
	}

	/// Deliver a response to its awaiting caller. Returns false for unknown ids,
	/// which is not an error: broadcast replies and pings land here too.
	pub fn complete(&self, id: &RequestId, msg: A2aMessage) -> bool {
		let Some(tx) = self.map.lock().unwrap().remove(id) else {
			return false;
		};
		tx.send(msg).is_ok()
	}

	fn remove(&self, id: &RequestId) {
		self.map.lock().unwrap().remove(id);
	}

	pub fn pending(&self) -> usize {
		self.map.lock().unwrap().len()
	}
}

/// Removes the listener when the awaiting caller goes away (timeout or cancel).
pub(crate) struct ListenerGuard {
	id: RequestId,
	shared: Arc<ConnShared>,
}

impl Drop for ListenerGuard {
	fn drop(&mut self) {
		self.shared.listeners.remove(&self.id);
	}
}

pub struct Connection {
	pub id: Strng,
	pub peer: Strng,
	pub protocol: ProtocolKind,
	pub config: Arc<PeerConfig>,
	connected: AtomicBool,
	state: Mutex<ConnState>,
	pub(crate) shared: Arc<ConnShared>,
	handle: tokio::sync::RwLock<Arc<dyn ProtocolHandle>>,
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("id", &self.id)
			.field("peer", &self.peer)
			.field("protocol", &self.protocol)
			.finish()
	}
}

impl Connection {
	pub(crate) fn new(
		id: Strng,
		peer: Strng,
		protocol: ProtocolKind,
		config: Arc<PeerConfig>,
		shared: Arc<ConnShared>,
		handle: Arc<dyn ProtocolHandle>,
	) -> Arc<Connection> {
		Arc::new(Connection {
			id,
			peer,
			protocol,
			config,
			connected: AtomicBool::new(true),
			state: Mutex::new(ConnState::Connected),
			shared,
			handle: tokio::sync::RwLock::new(handle),
		})
	}

	pub fn is_connected(&self) -> bool {
		self.connected.load(Ordering::Relaxed)
	}

	pub(crate) fn set_connected(&self, connected: bool) {
		self.connected.store(connected, Ordering::Relaxed);
	}

	pub fn state(&self) -> ConnState {
		*self.state.lock().unwrap()
	}

	pub(crate) fn set_state(&self, state: ConnState) {
		*self.state.lock().unwrap() = state;
	}

	pub fn last_activity(&self) -> u64 {
		self.shared.last_activity()
	}

	pub fn stats(&self) -> &ConnStats {
		&self.shared.stats
	}

	pub(crate) async fn handle(&self) -> Arc<dyn ProtocolHandle> {
		self.handle.read().await.clone()
	}

	/// Swap in a freshly-established protocol handle under the same connection
	/// id. Outstanding listeners keep waiting across the swap.
	pub(crate) async fn replace_handle(&self, handle: Arc<dyn ProtocolHandle>) {
		let old = {
			let mut guard = self.handle.write().await;
			std::mem::replace(&mut *guard, handle)
		};
		old.close().await;
		self.set_connected(true);
		self.set_state(ConnState::Connected);
		self.shared.touch();
	}

	pub fn idle_for(&self, now: u64) -> Duration {
		Duration::from_millis(now.saturating_sub(self.last_activity()))
	}
}
