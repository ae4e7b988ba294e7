//! Config-gated pre-send request optimization. Transformations preserve the
//! semantic intent of the request and never touch the prompt text.

use fabric_core::prelude::*;

use super::provider::{GenerateRequest, ReasoningPreference, UserTier};
use crate::shell::LatencyPredictor;

/// Token ceiling applied to non-enterprise tiers.
const TIER_TOKEN_CAP: u32 = 4096;

const MIN_ADAPTED_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_ADAPTED_TIMEOUT: Duration = Duration::from_secs(30);

/// Prompt phrases suggesting the request benefits from extended reasoning.
const REASONING_MARKERS: &[&str] = &[
	"prove",
	"derive",
	"step by step",
	"step-by-step",
	"reason about",
	"explain why",
	"analyze",
	"compare and contrast",
];

pub(super) fn optimize(request: &mut GenerateRequest, predictor: &LatencyPredictor) {
	// Adapt the timeout from the predictor, with headroom for variance.
	let predicted_ms = predictor.predict(
		request.prompt.len(),
		request.multimodal(),
		request.params.max_tokens.unwrap_or(1024),
	);
	let adapted = Duration::from_millis((predicted_ms * 2.0) as u64)
		.clamp(MIN_ADAPTED_TIMEOUT, MAX_ADAPTED_TIMEOUT);
	request.timeout = Some(request.timeout.map_or(adapted, |t| t.min(adapted)));

	// Clamp max tokens for non-enterprise tiers.
	let enterprise = matches!(request.tier, Some(UserTier::Enterprise | UserTier::Ultra));
	if !enterprise {
		let clamped = request
			.params
			.max_tokens
			.map_or(TIER_TOKEN_CAP, |t| t.min(TIER_TOKEN_CAP));
		if request.params.max_tokens != Some(clamped) {
			trace!(max_tokens = clamped, "clamped token budget for tier");
		}
		request.params.max_tokens = Some(clamped);
	}

	// Annotate a reasoning preference from simple prompt keyword analysis.
	if request.reasoning.is_none() {
		let lowered = request.prompt.to_lowercase();
		let wants_reasoning = REASONING_MARKERS.iter().any(|m| lowered.contains(m));
		request.reasoning = Some(if wants_reasoning {
			ReasoningPreference::Extended
		} else {
			ReasoningPreference::Standard
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clamps_tokens_for_free_tier_only() {
		let predictor = LatencyPredictor::new();

		let mut free = GenerateRequest::text("hi");
		free.tier = Some(UserTier::Free);
		free.params.max_tokens = Some(100_000);
		optimize(&mut free, &predictor);
		assert_eq!(free.params.max_tokens, Some(TIER_TOKEN_CAP));

		let mut enterprise = GenerateRequest::text("hi");
		enterprise.tier = Some(UserTier::Enterprise);
		enterprise.params.max_tokens = Some(100_000);
		optimize(&mut enterprise, &predictor);
		assert_eq!(enterprise.params.max_tokens, Some(100_000));
	}

	#[test]
	fn adapts_timeout_within_bounds() {
		let predictor = LatencyPredictor::new();
		let mut request = GenerateRequest::text("hello");
		optimize(&mut request, &predictor);
		let timeout = request.timeout.unwrap();
		assert!(timeout >= MIN_ADAPTED_TIMEOUT);
		assert!(timeout <= MAX_ADAPTED_TIMEOUT);
	}

	#[test]
	fn annotates_reasoning_without_touching_prompt() {
		let predictor = LatencyPredictor::new();
		let original = "Please prove this theorem step by step.";
		let mut request = GenerateRequest::text(original);
		optimize(&mut request, &predictor);
		assert_eq!(request.reasoning, Some(ReasoningPreference::Extended));
		assert_eq!(request.prompt, original);

		let mut plain = GenerateRequest::text("what's the weather");
		optimize(&mut plain, &predictor);
		assert_eq!(plain.reasoning, Some(ReasoningPreference::Standard));
	}
}
