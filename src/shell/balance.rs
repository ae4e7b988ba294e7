use std::sync::atomic::{AtomicUsize, Ordering};

use fabric_core::prelude::*;

/// Round-robin balancer over a tool's declared instances. Health-excluded
/// instances are never returned.
pub struct LoadBalancer {
	instances: Vec<Strng>,
	next: AtomicUsize,
}

impl LoadBalancer {
	pub fn new(instances: Vec<Strng>) -> LoadBalancer {
		LoadBalancer {
			instances,
			next: AtomicUsize::new(0),
		}
	}

	pub fn instances(&self) -> &[Strng] {
		&self.instances
	}

	/// Next healthy instance in rotation, or None when every instance is
	/// excluded.
	pub fn pick(&self, healthy: impl Fn(&Strng) -> bool) -> Option<Strng> {
		if self.instances.is_empty() {
			return None;
		}
		for _ in 0..self.instances.len() {
			let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.instances.len();
			let candidate = &self.instances[idx];
			if healthy(candidate) {
				return Some(candidate.clone());
			}
		}
		None
	}
}
