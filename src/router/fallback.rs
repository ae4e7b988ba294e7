use fabric_core::prelude::*;

use crate::config::BackoffKind;

/// Delay before retry `attempt` (1-based) under the configured backoff shape.
pub(super) fn backoff_delay(kind: BackoffKind, base: Duration, attempt: u32) -> Duration {
	match kind {
		BackoffKind::Linear => base * attempt,
		BackoffKind::Exponential => base * 2u32.pow(attempt.saturating_sub(1)),
		BackoffKind::Fixed => base,
	}
}

/// The provider order for one logical request: the routing decision's choice
/// first, then the fallback chain, cycled so retries past the chain's end wrap
/// around rather than starving.
pub(super) fn candidates(primary: &Strng, chain: &[Strng], attempts: usize) -> Vec<Strng> {
	let mut ring: Vec<Strng> = Vec::with_capacity(chain.len() + 1);
	ring.push(primary.clone());
	for provider in chain {
		if provider != primary {
			ring.push(provider.clone());
		}
	}
	(0..attempts).map(|i| ring[i % ring.len()].clone()).collect()
}
