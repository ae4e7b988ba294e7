//! Typed lifecycle notifications. Components publish connection and health
//! transitions through an injected [`LifecycleSink`] rather than an untyped
//! event bus; test harnesses inject a [`RecordingSink`].

use a2a_wire::A2aError;
use fabric_core::prelude::*;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
	Healthy,
	Degraded,
	Unhealthy,
}

pub trait LifecycleSink: Send + Sync {
	fn connection_established(&self, _conn: &Strng, _peer: &Strng) {}
	fn connection_closed(&self, _conn: &Strng, _peer: &Strng) {}
	fn connection_error(&self, _conn: &Strng, _peer: &Strng, _error: &A2aError) {}
	fn health_updated(&self, _target: &Strng, _state: HealthState, _error_rate: f64) {}
	fn strategy_outcome(&self, _tool: &Strng, _strategy: &'static str, _succeeded: bool) {}
}

/// Discards all notifications; the default when no sink is injected.
#[derive(Default, Clone, Copy)]
pub struct NoopSink;

impl LifecycleSink for NoopSink {}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
	ConnectionEstablished { conn: Strng, peer: Strng },
	ConnectionClosed { conn: Strng, peer: Strng },
	ConnectionError { conn: Strng, peer: Strng, kind: a2a_wire::ErrorKind },
	HealthUpdated { target: Strng, state: HealthState },
	StrategyOutcome { tool: Strng, strategy: &'static str, succeeded: bool },
}

/// Captures every notification for later inspection. Used by tests.
#[derive(Default)]
pub struct RecordingSink {
	events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn events(&self) -> Vec<LifecycleEvent> {
		self.events.lock().unwrap().clone()
	}

	pub fn take(&self) -> Vec<LifecycleEvent> {
		std::mem::take(&mut self.events.lock().unwrap())
	}

	fn push(&self, event: LifecycleEvent) {
		self.events.lock().unwrap().push(event);
	}
}

impl LifecycleSink for RecordingSink {
	fn connection_established(&self, conn: &Strng, peer: &Strng) {
		self.push(LifecycleEvent::ConnectionEstablished {
			conn: conn.clone(),
			peer: peer.clone(),
		});
	}

	fn connection_closed(&self, conn: &Strng, peer: &Strng) {
		self.push(LifecycleEvent::ConnectionClosed {
			conn: conn.clone(),
			peer: peer.clone(),
		});
	}

	fn connection_error(&self, conn: &Strng, peer: &Strng, error: &A2aError) {
		self.push(LifecycleEvent::ConnectionError {
			conn: conn.clone(),
			peer: peer.clone(),
			kind: error.kind,
		});
	}

	fn health_updated(&self, target: &Strng, state: HealthState, _error_rate: f64) {
		self.push(LifecycleEvent::HealthUpdated {
			target: target.clone(),
			state,
		});
	}

	fn strategy_outcome(&self, tool: &Strng, strategy: &'static str, succeeded: bool) {
		self.push(LifecycleEvent::StrategyOutcome {
			tool: tool.clone(),
			strategy,
			succeeded,
		});
	}
}
