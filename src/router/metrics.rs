use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use fabric_core::strng::RichStrng;

pub struct Metrics {
	pub requests: Family<ProviderLabel, Counter>,
	pub request_errors: Family<ProviderErrorLabel, Counter>,
	pub cache_hits: Counter,
	pub cache_misses: Counter,
	pub fallback_attempts: Family<ProviderLabel, Counter>,
	pub emergency_invocations: Counter,
	pub stream_requests: Family<ProviderLabel, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProviderLabel {
	pub provider: RichStrng,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProviderErrorLabel {
	pub provider: RichStrng,
	pub error_type: RichStrng,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let requests = Family::default();
		registry.register(
			"requests",
			"The total number of routed generation requests",
			requests.clone(),
		);

		let request_errors = Family::default();
		registry.register(
			"request_errors",
			"The total number of provider failures by error type",
			request_errors.clone(),
		);

		let cache_hits = Counter::default();
		registry.register(
			"cache_hits",
			"The total number of fingerprint cache hits",
			cache_hits.clone(),
		);

		let cache_misses = Counter::default();
		registry.register(
			"cache_misses",
			"The total number of fingerprint cache misses",
			cache_misses.clone(),
		);

		let fallback_attempts = Family::default();
		registry.register(
			"fallback_attempts",
			"The total number of fallback-chain attempts",
			fallback_attempts.clone(),
		);

		let emergency_invocations = Counter::default();
		registry.register(
			"emergency_invocations",
			"The total number of emergency-provider invocations",
			emergency_invocations.clone(),
		);

		let stream_requests = Family::default();
		registry.register(
			"stream_requests",
			"The total number of streaming requests",
			stream_requests.clone(),
		);

		Self {
			requests,
			request_errors,
			cache_hits,
			cache_misses,
			fallback_attempts,
			emergency_invocations,
			stream_requests,
		}
	}
}
