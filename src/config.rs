//! Declarative configuration for the fabric. Loaded from a YAML document with
//! environment-variable overrides layered on top.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use fabric_core::prelude::*;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub routing: RoutingConfig,
	#[serde(default)]
	pub cache: CacheConfig,
	#[serde(default)]
	pub circuit_breaker: CircuitConfig,
	#[serde(default)]
	pub health: HealthConfig,
	#[serde(default)]
	pub transport: TransportSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
	Latency,
	Cost,
	Quality,
	Balanced,
}

impl FromStr for RoutingStrategy {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"latency" => Ok(RoutingStrategy::Latency),
			"cost" => Ok(RoutingStrategy::Cost),
			"quality" => Ok(RoutingStrategy::Quality),
			"balanced" => Ok(RoutingStrategy::Balanced),
			other => anyhow::bail!("unknown routing strategy {other:?}"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
	Linear,
	Exponential,
	Fixed,
}

impl FromStr for BackoffKind {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"linear" => Ok(BackoffKind::Linear),
			"exponential" => Ok(BackoffKind::Exponential),
			"fixed" => Ok(BackoffKind::Fixed),
			other => anyhow::bail!("unknown backoff kind {other:?}"),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RoutingConfig {
	#[serde(default = "default_routing_strategy")]
	pub strategy: RoutingStrategy,
	#[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
	pub latency_target: Option<Duration>,
	#[serde(default = "default_router_retries")]
	pub max_retries: u32,
	#[serde(default = "default_backoff_kind")]
	pub backoff: BackoffKind,
	#[serde(
		default = "default_retry_delay",
		deserialize_with = "duration_str::deserialize_duration"
	)]
	pub retry_delay: Duration,
	#[serde(default)]
	pub fallback_chain: Vec<Strng>,
	#[serde(default)]
	pub emergency_fallback: Option<Strng>,
	/// Gate for pre-send request optimization (timeout adaptation, token
	/// clamping, reasoning annotation).
	#[serde(default)]
	pub optimize_requests: bool,
	#[serde(default = "default_max_reconnects")]
	pub max_stream_reconnects: u32,
}

impl Default for RoutingConfig {
	fn default() -> Self {
		Self {
			strategy: default_routing_strategy(),
			latency_target: None,
			max_retries: default_router_retries(),
			backoff: default_backoff_kind(),
			retry_delay: default_retry_delay(),
			fallback_chain: Vec::new(),
			emergency_fallback: None,
			optimize_requests: false,
			max_stream_reconnects: default_max_reconnects(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKeyStrategy {
	Exact,
	Semantic,
	Hybrid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_cache_strategy")]
	pub strategy: CacheKeyStrategy,
	#[serde(
		default = "default_cache_ttl",
		deserialize_with = "duration_str::deserialize_duration"
	)]
	pub ttl: Duration,
	#[serde(default = "default_cache_entries")]
	pub max_entries: usize,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			strategy: default_cache_strategy(),
			ttl: default_cache_ttl(),
			max_entries: default_cache_entries(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CircuitConfig {
	#[serde(default = "default_failure_threshold")]
	pub failure_threshold: u32,
	#[serde(
		default = "default_reset_timeout",
		deserialize_with = "duration_str::deserialize_duration"
	)]
	pub reset_timeout: Duration,
}

impl Default for CircuitConfig {
	fn default() -> Self {
		Self {
			failure_threshold: default_failure_threshold(),
			reset_timeout: default_reset_timeout(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthConfig {
	#[serde(
		default = "default_health_interval",
		deserialize_with = "duration_str::deserialize_duration"
	)]
	pub check_interval: Duration,
	#[serde(default)]
	pub alert_thresholds: AlertThresholds,
	/// Webhook URLs alerts are published to. Delivery itself is a collaborator.
	#[serde(default)]
	pub webhooks: Vec<String>,
}

impl Default for HealthConfig {
	fn default() -> Self {
		Self {
			check_interval: default_health_interval(),
			alert_thresholds: AlertThresholds::default(),
			webhooks: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AlertThresholds {
	#[serde(default = "default_error_rate_threshold")]
	pub error_rate: f64,
	#[serde(
		default = "default_latency_threshold",
		deserialize_with = "duration_str::deserialize_duration"
	)]
	pub latency: Duration,
	#[serde(default = "default_availability_threshold")]
	pub availability: f64,
}

impl Default for AlertThresholds {
	fn default() -> Self {
		Self {
			error_rate: default_error_rate_threshold(),
			latency: default_latency_threshold(),
			availability: default_availability_threshold(),
		}
	}
}

/// Protocols this installation can speak. Deserialization never fails: a name
/// we do not recognize becomes [`ProtocolKind::Unknown`], and the configured
/// [`UnknownProtocolPolicy`] decides what `connect` does with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
	Websocket,
	Http2,
	Grpc,
	FramedTcp,
	Unknown(Strng),
}

impl ProtocolKind {
	pub fn label(&self) -> Strng {
		match self {
			ProtocolKind::Websocket => strng::literal!("websocket"),
			ProtocolKind::Http2 => strng::literal!("http2"),
			ProtocolKind::Grpc => strng::literal!("grpc"),
			ProtocolKind::FramedTcp => strng::literal!("framed_tcp"),
			ProtocolKind::Unknown(name) => name.clone(),
		}
	}
}

impl FromStr for ProtocolKind {
	type Err = std::convert::Infallible;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s {
			"websocket" => ProtocolKind::Websocket,
			"http2" => ProtocolKind::Http2,
			"grpc" => ProtocolKind::Grpc,
			"framed_tcp" => ProtocolKind::FramedTcp,
			other => ProtocolKind::Unknown(strng::new(other)),
		})
	}
}

impl std::fmt::Display for ProtocolKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.label())
	}
}

impl<'de> Deserialize<'de> for ProtocolKind {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(s.parse().expect("infallible"))
	}
}

/// What to do with a peer configured for a protocol this installation does not
/// recognize. Policy is fixed per installation, never per call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownProtocolPolicy {
	#[default]
	Refuse,
	FallbackHttp2,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthMode {
	#[default]
	None,
	Token {
		token: String,
	},
	Certificate,
	Oauth2 {
		token: String,
	},
}

impl AuthMode {
	/// The bearer token carried by this mode, when there is one.
	pub fn bearer(&self) -> Option<&str> {
		match self {
			AuthMode::Token { token } | AuthMode::Oauth2 { token } => Some(token),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TlsSettings {
	pub ca: Option<PathBuf>,
	pub cert: Option<PathBuf>,
	pub key: Option<PathBuf>,
	#[serde(default = "default_true")]
	pub verify: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PeerConfig {
	pub peer: Strng,
	pub protocol: ProtocolKind,
	pub host: String,
	pub port: Option<u16>,
	/// Request path for HTTP-shaped protocols.
	pub path: Option<String>,
	pub tls: Option<TlsSettings>,
	#[serde(default)]
	pub auth: AuthMode,
	#[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
	pub connect_timeout: Option<Duration>,
	#[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
	pub request_timeout: Option<Duration>,
	#[serde(default)]
	pub keep_alive: bool,
}

impl PeerConfig {
	pub fn validate(&self) -> anyhow::Result<()> {
		if self.host.is_empty() {
			anyhow::bail!("peer {}: host must not be empty", self.peer);
		}
		if self.port == Some(0) {
			anyhow::bail!("peer {}: port must be within [1, 65535]", self.peer);
		}
		Ok(())
	}

	pub fn port_or_default(&self) -> u16 {
		self.port.unwrap_or(match self.protocol {
			ProtocolKind::Websocket => {
				if self.tls.is_some() {
					443
				} else {
					80
				}
			},
			_ => {
				if self.tls.is_some() {
					443
				} else {
					8080
				}
			},
		})
	}

	pub fn path_or_default(&self) -> &str {
		match self.path.as_deref() {
			Some("") | None => "/a2a",
			Some(p) => p,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReconnectConfig {
	#[serde(default = "default_reconnect_attempts")]
	pub max_attempts: u32,
	#[serde(
		default = "default_reconnect_base",
		deserialize_with = "duration_str::deserialize_duration"
	)]
	pub base_delay: Duration,
	#[serde(default = "default_reconnect_multiplier")]
	pub multiplier: f64,
	#[serde(
		default = "default_reconnect_cap",
		deserialize_with = "duration_str::deserialize_duration"
	)]
	pub max_delay: Duration,
}

impl Default for ReconnectConfig {
	fn default() -> Self {
		Self {
			max_attempts: default_reconnect_attempts(),
			base_delay: default_reconnect_base(),
			multiplier: default_reconnect_multiplier(),
			max_delay: default_reconnect_cap(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransportSettings {
	#[serde(default)]
	pub peers: Vec<PeerConfig>,
	#[serde(default = "default_max_per_peer")]
	pub max_per_peer: usize,
	#[serde(default = "default_max_total")]
	pub max_total: usize,
	#[serde(
		default = "default_idle_ttl",
		deserialize_with = "duration_str::deserialize_duration"
	)]
	pub idle_ttl: Duration,
	#[serde(
		default = "default_cleanup_interval",
		deserialize_with = "duration_str::deserialize_duration"
	)]
	pub cleanup_interval: Duration,
	#[serde(
		default = "default_request_timeout",
		deserialize_with = "duration_str::deserialize_duration"
	)]
	pub request_timeout: Duration,
	#[serde(default = "default_send_retries")]
	pub max_retries: u32,
	#[serde(
		default = "default_retry_base",
		deserialize_with = "duration_str::deserialize_duration"
	)]
	pub retry_base_delay: Duration,
	#[serde(default)]
	pub reconnect: ReconnectConfig,
	#[serde(default)]
	pub unknown_protocol: UnknownProtocolPolicy,
}

impl Default for TransportSettings {
	fn default() -> Self {
		Self {
			peers: Vec::new(),
			max_per_peer: default_max_per_peer(),
			max_total: default_max_total(),
			idle_ttl: default_idle_ttl(),
			cleanup_interval: default_cleanup_interval(),
			request_timeout: default_request_timeout(),
			max_retries: default_send_retries(),
			retry_base_delay: default_retry_base(),
			reconnect: ReconnectConfig::default(),
			unknown_protocol: UnknownProtocolPolicy::default(),
		}
	}
}

pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let mut config: Config = serde_yaml::from_str(contents).context("parsing config")?;
	apply_env(&mut config)?;
	for peer in &config.transport.peers {
		peer.validate()?;
	}
	Ok(config)
}

/// Environment overrides layered over the file contents.
fn apply_env(config: &mut Config) -> anyhow::Result<()> {
	if let Some(strategy) = parse::<RoutingStrategy>("ROUTING_STRATEGY")? {
		config.routing.strategy = strategy;
	}
	if let Some(target) = parse_duration("LATENCY_TARGET")? {
		config.routing.latency_target = Some(target);
	}
	if let Some(retries) = parse::<u32>("MAX_RETRIES")? {
		config.routing.max_retries = retries;
	}
	if let Some(kind) = parse::<BackoffKind>("RETRY_BACKOFF")? {
		config.routing.backoff = kind;
	}
	if let Some(delay) = parse_duration("RETRY_DELAY")? {
		config.routing.retry_delay = delay;
	}
	if let Some(chain) = parse::<String>("FALLBACK_CHAIN")? {
		config.routing.fallback_chain = chain
			.split(',')
			.filter(|s| !s.is_empty())
			.map(strng::new)
			.collect();
	}
	if let Some(provider) = parse::<String>("EMERGENCY_FALLBACK")? {
		config.routing.emergency_fallback = Some(strng::new(provider));
	}
	if let Some(ttl) = parse_duration("CACHE_TTL")? {
		config.cache.ttl = ttl;
	}
	if let Some(max) = parse::<usize>("CACHE_MAX_ENTRIES")? {
		config.cache.max_entries = max;
	}
	if let Some(threshold) = parse::<u32>("CIRCUIT_FAILURE_THRESHOLD")? {
		config.circuit_breaker.failure_threshold = threshold;
	}
	if let Some(reset) = parse_duration("CIRCUIT_RESET_TIMEOUT")? {
		config.circuit_breaker.reset_timeout = reset;
	}
	if let Some(interval) = parse_duration("HEALTH_CHECK_INTERVAL")? {
		config.health.check_interval = interval;
	}
	Ok(())
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(env) {
		Ok(val) => val
			.parse()
			.map(|v| Some(v))
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}

fn parse_duration(env: &str) -> anyhow::Result<Option<Duration>> {
	parse::<String>(env)?
		.map(|ds| {
			duration_str::parse(&ds)
				.map_err(|e| anyhow::anyhow!("invalid env var {}={} ({})", env, ds, e))
		})
		.transpose()
}

fn default_true() -> bool {
	true
}

fn default_routing_strategy() -> RoutingStrategy {
	RoutingStrategy::Balanced
}

fn default_router_retries() -> u32 {
	3
}

fn default_backoff_kind() -> BackoffKind {
	BackoffKind::Exponential
}

fn default_retry_delay() -> Duration {
	Duration::from_secs(1)
}

fn default_max_reconnects() -> u32 {
	3
}

fn default_cache_strategy() -> CacheKeyStrategy {
	CacheKeyStrategy::Exact
}

fn default_cache_ttl() -> Duration {
	Duration::from_secs(300)
}

fn default_cache_entries() -> usize {
	1000
}

fn default_failure_threshold() -> u32 {
	5
}

fn default_reset_timeout() -> Duration {
	Duration::from_secs(30)
}

fn default_health_interval() -> Duration {
	Duration::from_secs(30)
}

fn default_error_rate_threshold() -> f64 {
	0.1
}

fn default_latency_threshold() -> Duration {
	Duration::from_secs(5)
}

fn default_availability_threshold() -> f64 {
	0.95
}

fn default_max_per_peer() -> usize {
	5
}

fn default_max_total() -> usize {
	1000
}

fn default_idle_ttl() -> Duration {
	Duration::from_secs(300)
}

fn default_cleanup_interval() -> Duration {
	Duration::from_secs(300)
}

fn default_request_timeout() -> Duration {
	Duration::from_secs(30)
}

fn default_send_retries() -> u32 {
	3
}

fn default_retry_base() -> Duration {
	Duration::from_millis(200)
}

fn default_reconnect_attempts() -> u32 {
	5
}

fn default_reconnect_base() -> Duration {
	Duration::from_secs(1)
}

fn default_reconnect_multiplier() -> f64 {
	2.0
}

fn default_reconnect_cap() -> Duration {
	Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults() {
		let config = parse_config("{}").unwrap();
		assert_eq!(config.routing.strategy, RoutingStrategy::Balanced);
		assert_eq!(config.transport.max_per_peer, 5);
		assert_eq!(config.transport.max_total, 1000);
		assert_eq!(config.transport.request_timeout, Duration::from_secs(30));
		assert_eq!(config.circuit_breaker.failure_threshold, 5);
		assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_secs(30));
		assert_eq!(config.cache.max_entries, 1000);
	}

	#[test]
	fn full_document() {
		let config = parse_config(
			r#"
routing:
  strategy: latency
  maxRetries: 2
  backoff: fixed
  retryDelay: 10ms
  fallbackChain: [g-pro]
  emergencyFallback: g-fast
cache:
  strategy: hybrid
  ttl: 1m
  maxEntries: 64
transport:
  maxPerPeer: 2
  unknownProtocol: fallback_http2
  peers:
    - peer: agent-b
      protocol: framed_tcp
      host: localhost
      port: 9000
      keepAlive: true
    - peer: agent-c
      protocol: websocket
      host: example.com
      auth:
        mode: token
        token: secret
"#,
		)
		.unwrap();
		assert_eq!(config.routing.strategy, RoutingStrategy::Latency);
		assert_eq!(config.routing.backoff, BackoffKind::Fixed);
		assert_eq!(config.routing.retry_delay, Duration::from_millis(10));
		assert_eq!(config.routing.fallback_chain, vec![strng::new("g-pro")]);
		assert_eq!(config.cache.strategy, CacheKeyStrategy::Hybrid);
		assert_eq!(
			config.transport.unknown_protocol,
			UnknownProtocolPolicy::FallbackHttp2
		);
		let peers = &config.transport.peers;
		assert_eq!(peers[0].protocol, ProtocolKind::FramedTcp);
		assert!(peers[0].keep_alive);
		assert_eq!(peers[1].auth.bearer(), Some("secret"));
		assert_eq!(peers[1].port_or_default(), 80);
		assert_eq!(peers[1].path_or_default(), "/a2a");
	}

	#[test]
	fn unknown_protocol_parses() {
		let config = parse_config(
			r#"
transport:
  peers:
    - peer: odd
      protocol: quic
      host: localhost
"#,
		)
		.unwrap();
		assert_eq!(
			config.transport.peers[0].protocol,
			ProtocolKind::Unknown(strng::new("quic"))
		);
	}

	#[test]
	fn rejects_empty_host() {
		let err = parse_config(
			r#"
transport:
  peers:
    - peer: bad
      protocol: http2
      host: ""
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("host"));
	}

	#[test]
	fn rejects_port_zero() {
		let err = parse_config(
			r#"
transport:
  peers:
    - peer: bad
      protocol: http2
      host: localhost
      port: 0
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("port"));
	}
}
