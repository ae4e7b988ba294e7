use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use fabric_core::strng::RichStrng;

pub struct Metrics {
	pub invocations: Family<CapabilityCall, Counter>,
	pub invocation_errors: Family<CapabilityError, Counter>,
	pub invocation_latency: Family<CapabilityCall, Histogram>,
	pub compositions_executed: Family<CompositionRun, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CapabilityCall {
	pub capability: RichStrng,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CapabilityError {
	pub capability: RichStrng,
	pub error_type: RichStrng,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CompositionRun {
	pub composition: RichStrng,
	pub strategy: RichStrng,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let invocations = Family::default();
		registry.register(
			"capability_invocations",
			"The total number of capability invocations",
			invocations.clone(),
		);

		let invocation_errors = Family::default();
		registry.register(
			"capability_invocation_errors",
			"The total number of failed capability invocations",
			invocation_errors.clone(),
		);

		let invocation_latency = Family::<CapabilityCall, Histogram>::new_with_constructor(|| {
			Histogram::new(exponential_buckets(1.0, 2.0, 14))
		});
		registry.register(
			"capability_invocation_latency_ms",
			"Capability invocation latency in milliseconds",
			invocation_latency.clone(),
		);

		let compositions_executed = Family::default();
		registry.register(
			"compositions_executed",
			"The total number of composition executions",
			compositions_executed.clone(),
		);

		Self {
			invocations,
			invocation_errors,
			invocation_latency,
			compositions_executed,
		}
	}
}
