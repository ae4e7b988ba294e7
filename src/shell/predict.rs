use std::collections::VecDeque;

use fabric_core::prelude::*;

const MAX_SAMPLES: usize = 1000;
const MAX_PREDICTION_MS: f64 = 30_000.0;
const DEFAULT_PREDICTION_MS: f64 = 500.0;

#[derive(Debug, Clone, Copy)]
struct Sample {
	prompt_len: f64,
	multimodal: bool,
	max_tokens: f64,
	latency_ms: f64,
}

#[derive(Default)]
struct Inner {
	samples: VecDeque<Sample>,
}

/// Online latency predictor: a moving-average regression over recent
/// `(promptLength, hasMultimodal, maxTokens) → latency` samples, trained on
/// every completed request. Predictions are clamped to [0, 30 000] ms.
pub struct LatencyPredictor {
	inner: Mutex<Inner>,
}

impl Default for LatencyPredictor {
	fn default() -> Self {
		Self::new()
	}
}

impl LatencyPredictor {
	pub fn new() -> LatencyPredictor {
		LatencyPredictor {
			inner: Mutex::new(Inner::default()),
		}
	}

	pub fn record(&self, prompt_len: usize, multimodal: bool, max_tokens: u32, latency: Duration) {
		let mut inner = self.inner.lock().unwrap();
		if inner.samples.len() >= MAX_SAMPLES {
			inner.samples.pop_front();
		}
		inner.samples.push_back(Sample {
			prompt_len: prompt_len as f64,
			multimodal,
			max_tokens: max_tokens as f64,
			latency_ms: latency.as_secs_f64() * 1000.0,
		});
	}

	pub fn sample_count(&self) -> usize {
		self.inner.lock().unwrap().samples.len()
	}

	pub fn predict(&self, prompt_len: usize, multimodal: bool, max_tokens: u32) -> f64 {
		let inner = self.inner.lock().unwrap();
		if inner.samples.is_empty() {
			return DEFAULT_PREDICTION_MS;
		}
		let n = inner.samples.len() as f64;
		let avg_latency = inner.samples.iter().map(|s| s.latency_ms).sum::<f64>() / n;
		let avg_prompt = (inner.samples.iter().map(|s| s.prompt_len).sum::<f64>() / n).max(1.0);
		let avg_tokens = (inner.samples.iter().map(|s| s.max_tokens).sum::<f64>() / n).max(1.0);

		// Scale the moving average by how this request compares to the typical
		// sample, with a flat surcharge when multimodal requests have been
		// observed to run slower.
		let prompt_factor = (prompt_len as f64 / avg_prompt).clamp(0.25, 4.0);
		let token_factor = (max_tokens as f64 / avg_tokens).clamp(0.25, 4.0);
		let mut prediction = avg_latency * (0.5 + 0.3 * prompt_factor + 0.2 * token_factor);

		if multimodal {
			let (mm_sum, mm_count) = inner
				.samples
				.iter()
				.filter(|s| s.multimodal)
				.fold((0.0, 0u32), |(sum, count), s| (sum + s.latency_ms, count + 1));
			if mm_count > 0 {
				let mm_avg = mm_sum / mm_count as f64;
				prediction += (mm_avg - avg_latency).max(0.0);
			} else {
				prediction *= 1.5;
			}
		}
		prediction.clamp(0.0, MAX_PREDICTION_MS)
	}
}
