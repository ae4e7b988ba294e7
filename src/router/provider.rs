use std::collections::{HashMap, VecDeque};

use a2a_wire::{A2aError, Priority};
use async_trait::async_trait;
use fabric_core::prelude::*;
use serde::{Deserialize, Serialize};

use super::stream::ChunkStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
	Free,
	Pro,
	Enterprise,
	Ultra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
	Image,
	Audio,
	Video,
	Document,
}

/// Handle to a multimodal payload: either a reference the provider resolves or
/// inline bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaHandle {
	pub kind: MediaKind,
	pub uri: Option<String>,
	pub data: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningPreference {
	Standard,
	Extended,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateParams {
	pub max_tokens: Option<u32>,
	pub temperature: Option<f64>,
	pub top_p: Option<f64>,
	pub top_k: Option<u32>,
	pub stop_sequences: Vec<String>,
	pub stream: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateRequest {
	pub prompt: String,
	pub params: GenerateParams,
	pub media: Vec<MediaHandle>,
	pub tier: Option<UserTier>,
	pub priority: Option<Priority>,
	pub latency_target: Option<Duration>,
	pub preferred_provider: Option<Strng>,
	/// Set by the pre-send optimizer; never alters the prompt itself.
	pub reasoning: Option<ReasoningPreference>,
	/// Adapted per request from the latency predictor when optimization is on.
	pub timeout: Option<Duration>,
}

impl GenerateRequest {
	pub fn text(prompt: impl Into<String>) -> GenerateRequest {
		GenerateRequest {
			prompt: prompt.into(),
			..Default::default()
		}
	}

	pub fn multimodal(&self) -> bool {
		!self.media.is_empty()
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateResponse {
	pub provider: Strng,
	pub model: Option<Strng>,
	pub content: String,
	pub input_tokens: Option<u64>,
	pub output_tokens: Option<u64>,
	pub latency: Duration,
	pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
	pub content: String,
	pub index: u64,
}

/// Passed to providers on every dispatch. The attempt counter carries
/// stream-resumption state across reconnects.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchContext {
	pub attempt: u32,
}

/// Static declaration of a provider's pricing and capabilities, used by the
/// routing strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSpec {
	pub id: Strng,
	pub cost_per_1k_tokens: f64,
	pub multimodal: bool,
	pub long_context: bool,
	/// Declared output quality in [0, 1].
	pub quality: f64,
}

/// The pluggable model-adapter contract. Vendor-specific transformation lives
/// behind this seam.
#[async_trait]
pub trait ModelProvider: Send + Sync {
	fn spec(&self) -> ProviderSpec;

	async fn generate(
		&self,
		request: &GenerateRequest,
		ctx: &DispatchContext,
	) -> Result<GenerateResponse, A2aError>;

	async fn generate_stream(
		&self,
		request: &GenerateRequest,
		ctx: &DispatchContext,
	) -> Result<ChunkStream, A2aError>;
}

const PROFILE_WINDOW: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct RunningAvg {
	count: u64,
	avg: f64,
}

impl RunningAvg {
	fn record(&mut self, value: f64) {
		let n = (self.count + 1) as f64;
		self.avg = (self.avg * (n - 1.0) + value) / n;
		self.count += 1;
	}
}

/// Observed performance per provider: bounded latency window with percentile
/// reads, success counters, throughput, and per-tier latency adjustments.
#[derive(Debug, Clone, Default)]
pub struct PerformanceProfile {
	latencies: VecDeque<f64>,
	successes: u64,
	failures: u64,
	window_start: Option<Instant>,
	by_tier: HashMap<UserTier, RunningAvg>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfileSnapshot {
	pub avg_latency_ms: f64,
	pub p95_latency_ms: f64,
	pub p99_latency_ms: f64,
	pub success_rate: f64,
	pub error_rate: f64,
	pub throughput_per_min: f64,
	pub samples: usize,
}

impl PerformanceProfile {
	pub fn record(&mut self, latency: Duration, success: bool, tier: Option<UserTier>) {
		if self.latencies.len() >= PROFILE_WINDOW {
			self.latencies.pop_front();
		}
		let latency_ms = latency.as_secs_f64() * 1000.0;
		self.latencies.push_back(latency_ms);
		if success {
			self.successes += 1;
		} else {
			self.failures += 1;
		}
		if self.window_start.is_none() {
			self.window_start = Some(Instant::now());
		}
		if let Some(tier) = tier {
			self.by_tier.entry(tier).or_default().record(latency_ms);
		}
	}

	fn percentile(sorted: &[f64], p: f64) -> f64 {
		if sorted.is_empty() {
			return 0.0;
		}
		let idx = ((sorted.len() as f64 * p).ceil() as usize).min(sorted.len()) - 1;
		sorted[idx]
	}

	pub fn tier_latency_ms(&self, tier: UserTier) -> Option<f64> {
		self.by_tier.get(&tier).map(|avg| avg.avg)
	}

	pub fn snapshot(&self) -> ProfileSnapshot {
		let total = self.successes + self.failures;
		let mut sorted: Vec<f64> = self.latencies.iter().copied().collect();
		sorted.sort_by(f64::total_cmp);
		let avg = if sorted.is_empty() {
			0.0
		} else {
			sorted.iter().sum::<f64>() / sorted.len() as f64
		};
		let elapsed_min = self
			.window_start
			.map(|t| t.elapsed().as_secs_f64() / 60.0)
			.unwrap_or(0.0)
			.max(1.0 / 60.0);
		ProfileSnapshot {
			avg_latency_ms: avg,
			p95_latency_ms: Self::percentile(&sorted, 0.95),
			p99_latency_ms: Self::percentile(&sorted, 0.99),
			success_rate: if total == 0 {
				1.0
			} else {
				self.successes as f64 / total as f64
			},
			error_rate: if total == 0 {
				0.0
			} else {
				self.failures as f64 / total as f64
			},
			throughput_per_min: total as f64 / elapsed_min,
			samples: sorted.len(),
		}
	}
}
