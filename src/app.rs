//! The application root: owns component lifetimes, wires them together, and
//! drives ordered shutdown (registry → router → shell → transport).

use std::sync::Mutex;

use fabric_core::drain;
use fabric_core::drain::DrainMode;
use fabric_core::prelude::*;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

use crate::config::Config;
use crate::lifecycle::{LifecycleSink, NoopSink};
use crate::registry::CapabilityRegistry;
use crate::router::Router;
use crate::shell::Shell;
use crate::transport::Transport;

pub struct Application {
	pub config: Arc<Config>,
	pub registry: Arc<CapabilityRegistry>,
	pub router: Arc<Router>,
	pub shell: Arc<Shell>,
	pub transport: Arc<Transport>,
	metrics: Arc<Mutex<Registry>>,
	drain_tx: drain::DrainTrigger,
}

impl Application {
	pub fn new(config: Config) -> Application {
		Application::with_sink(config, Arc::new(NoopSink))
	}

	pub fn with_sink(config: Config, sink: Arc<dyn LifecycleSink>) -> Application {
		let config = Arc::new(config);
		let mut metrics = Registry::default();

		let shell = Shell::new(
			config.circuit_breaker.clone(),
			config.health.clone(),
			sink.clone(),
		);
		let transport = Transport::new(config.transport.clone(), &mut metrics, sink.clone());
		let router = Router::new(
			config.routing.clone(),
			config.cache.clone(),
			shell.clone(),
			&mut metrics,
		);
		let registry = CapabilityRegistry::new(&mut metrics);

		let (drain_tx, drain_rx) = drain::new();
		spawn_health_loop(config.clone(), router.clone(), drain_rx);

		Application {
			config,
			registry,
			router,
			shell,
			transport,
			metrics: Arc::new(Mutex::new(metrics)),
			drain_tx,
		}
	}

	pub fn from_yaml(contents: &str) -> anyhow::Result<Application> {
		Ok(Application::new(crate::config::parse_config(contents)?))
	}

	/// Connect to every configured peer. Returns the number of connections
	/// established; individual failures are logged, not fatal.
	pub async fn start(&self) -> usize {
		self.transport.initialize().await
	}

	/// Prometheus text exposition of every component's metrics.
	pub fn encode_metrics(&self) -> String {
		let mut buffer = String::new();
		let registry = self.metrics.lock().unwrap();
		if let Err(e) = encode(&mut buffer, &registry) {
			error!("failed to encode metrics: {e}");
		}
		buffer
	}

	/// Ordered shutdown: the registry stops accepting work first, then the
	/// router, then the shell's background consumers, and the transport closes
	/// its connections last so in-flight teardown can still reach peers.
	pub async fn shutdown(self) {
		info!("shutting down");
		let Application {
			registry,
			router,
			shell,
			transport,
			drain_tx,
			..
		} = self;
		drop(registry);
		drop(router);
		drop(shell);
		drain_tx.start_drain_and_wait(DrainMode::Graceful).await;
		transport.shutdown().await;
		info!("shutdown complete");
	}
}

/// Periodic system-health evaluation against the configured alert thresholds.
/// Alert delivery to webhooks is a collaborator; breaches are logged here.
fn spawn_health_loop(config: Arc<Config>, router: Arc<Router>, drain_rx: drain::DrainWatcher) {
	let interval = config.health.check_interval;
	tokio::spawn(async move {
		let release = tokio::select! {
			release = drain_rx.signaled() => release,
			_ = async {
				loop {
					tokio::time::sleep(interval).await;
					let thresholds = &config.health.alert_thresholds;
					for (provider, health) in router.health() {
						if health.profile.error_rate > thresholds.error_rate {
							warn!(
								%provider,
								error_rate = health.profile.error_rate,
								webhooks = config.health.webhooks.len(),
								"provider error rate above alert threshold"
							);
						}
						let latency_ms = thresholds.latency.as_secs_f64() * 1000.0;
						if health.profile.p95_latency_ms > latency_ms {
							warn!(
								%provider,
								p95 = health.profile.p95_latency_ms,
								"provider latency above alert threshold"
							);
						}
						if health.profile.success_rate < thresholds.availability {
							warn!(
								%provider,
								availability = health.profile.success_rate,
								"provider availability below alert threshold"
							);
						}
					}
				}
			} => unreachable!("health loop never completes"),
		};
		drop(release);
	});
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::{CallerContext, Capability, Schema, invoker_fn};
	use a2a_wire::Value;

	fn minimal_config() -> Config {
		crate::config::parse_config("{}").unwrap()
	}

	#[tokio::test]
	async fn builds_wires_and_shuts_down() {
		let app = Application::new(minimal_config());
		assert_eq!(app.start().await, 0);

		app
			.registry
			.register(
				"demo.echo",
				Capability {
					name: strng::new("demo.echo"),
					version: strng::new("1.0.0"),
					description: "echoes input".to_string(),
					parameters: Schema::default(),
					security: Default::default(),
					performance: Default::default(),
					tags: vec![],
				},
				invoker_fn(Ok),
			)
			.unwrap();
		let out = app
			.registry
			.invoke(
				&strng::new("demo.echo"),
				Value::from("hello"),
				&CallerContext::default(),
			)
			.await
			.unwrap();
		assert_eq!(out.as_str(), Some("hello"));

		let exposition = app.encode_metrics();
		assert!(exposition.contains("registry_capability_invocations"));
		app.shutdown().await;
	}

	#[tokio::test]
	async fn from_yaml_round_trip() {
		let app = Application::from_yaml(
			r#"
routing:
  strategy: quality
cache:
  maxEntries: 16
"#,
		)
		.unwrap();
		assert_eq!(app.config.cache.max_entries, 16);
		app.shutdown().await;
	}
}
