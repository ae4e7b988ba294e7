use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use fabric_core::strng::RichStrng;

pub struct Metrics {
	pub connections_established: Family<ConnLabel, Counter>,
	pub connections_closed: Family<ConnLabel, Counter>,
	pub connections_active: Gauge,
	pub reconnects: Family<ConnLabel, Counter>,
	pub messages_sent: Family<ConnLabel, Counter>,
	pub messages_received: Family<ConnLabel, Counter>,
	pub send_errors: Family<ErrorLabel, Counter>,
	pub broadcast_failures: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnLabel {
	pub peer: RichStrng,
	pub protocol: RichStrng,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabel {
	pub peer: RichStrng,
	pub error_type: RichStrng,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let connections_established = Family::default();
		registry.register(
			"connections_established",
			"The total number of connections established",
			connections_established.clone(),
		);

		let connections_closed = Family::default();
		registry.register(
			"connections_closed",
			"The total number of connections closed",
			connections_closed.clone(),
		);

		let connections_active = Gauge::default();
		registry.register(
			"connections_active",
			"The number of currently live connections",
			connections_active.clone(),
		);

		let reconnects = Family::default();
		registry.register(
			"reconnects",
			"The total number of successful reconnections",
			reconnects.clone(),
		);

		let messages_sent = Family::default();
		registry.register(
			"messages_sent",
			"The total number of messages sent",
			messages_sent.clone(),
		);

		let messages_received = Family::default();
		registry.register(
			"messages_received",
			"The total number of messages received",
			messages_received.clone(),
		);

		let send_errors = Family::default();
		registry.register(
			"send_errors",
			"The total number of send failures by error type",
			send_errors.clone(),
		);

		let broadcast_failures = Counter::default();
		registry.register(
			"broadcast_failures",
			"The total number of per-peer broadcast failures",
			broadcast_failures.clone(),
		);

		Self {
			connections_established,
			connections_closed,
			connections_active,
			reconnects,
			messages_sent,
			messages_received,
			send_errors,
			broadcast_failures,
		}
	}
}
