//! Deterministic request fingerprints and the decision/response cache keyed by
//! them. Exact keys hash the canonical request; semantic keys normalize the
//! prompt and bucket the parameters first; hybrid tries exact then semantic.

use std::collections::HashMap;

use fabric_core::prelude::*;
use ring::digest;
use serde::Serialize;

use super::provider::{GenerateRequest, GenerateResponse};
use super::{DecisionReason, RoutingDecision};
use crate::config::{CacheConfig, CacheKeyStrategy};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub Strng);

impl std::fmt::Display for Fingerprint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

/// The routing-affecting subset of a request, serialized canonically.
#[derive(Serialize)]
struct CanonicalRequest<'a> {
	prompt: &'a str,
	max_tokens: Option<u32>,
	temperature: Option<f64>,
	top_p: Option<f64>,
	top_k: Option<u32>,
	stop_sequences: &'a [String],
	tier: Option<&'static str>,
	preferred: Option<&'a str>,
	media_kinds: Vec<&'static str>,
}

fn sha256_hex(bytes: &[u8]) -> Strng {
	let hash = digest::digest(&digest::SHA256, bytes);
	strng::new(hex::encode(hash.as_ref()))
}

fn tier_name(request: &GenerateRequest) -> Option<&'static str> {
	use super::provider::UserTier::*;
	request.tier.map(|t| match t {
		Free => "free",
		Pro => "pro",
		Enterprise => "enterprise",
		Ultra => "ultra",
	})
}

fn media_kinds(request: &GenerateRequest) -> Vec<&'static str> {
	use super::provider::MediaKind::*;
	request
		.media
		.iter()
		.map(|m| match m.kind {
			Image => "image",
			Audio => "audio",
			Video => "video",
			Document => "document",
		})
		.collect()
}

pub fn exact(request: &GenerateRequest) -> Fingerprint {
	let canonical = CanonicalRequest {
		prompt: &request.prompt,
		max_tokens: request.params.max_tokens,
		temperature: request.params.temperature,
		top_p: request.params.top_p,
		top_k: request.params.top_k,
		stop_sequences: &request.params.stop_sequences,
		tier: tier_name(request),
		preferred: request.preferred_provider.as_deref(),
		media_kinds: media_kinds(request),
	};
	let bytes = serde_json::to_vec(&canonical).expect("canonical request serializes");
	Fingerprint(sha256_hex(&bytes))
}

/// Lowercase, collapse whitespace, bucket the parameters. Requests that differ
/// only in formatting or small parameter jitter share a semantic key.
pub fn semantic(request: &GenerateRequest) -> Fingerprint {
	let normalized: String = request
		.prompt
		.to_lowercase()
		.split_whitespace()
		.collect::<Vec<_>>()
		.join(" ");
	let token_bucket = request.params.max_tokens.unwrap_or(0).div_ceil(256);
	let temp_bucket = (request.params.temperature.unwrap_or(0.0) * 10.0).round() as i64;
	let key = format!(
		"{normalized}|t{token_bucket}|T{temp_bucket}|m{}|{}",
		request.media.len(),
		tier_name(request).unwrap_or("-"),
	);
	Fingerprint(sha256_hex(key.as_bytes()))
}

struct Entry {
	fingerprint: Fingerprint,
	decision: RoutingDecision,
	response: Option<GenerateResponse>,
	inserted: Instant,
	last_access: u64,
}

#[derive(Default)]
struct Inner {
	map: HashMap<Fingerprint, Entry>,
	access_clock: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
	pub entries: usize,
	pub hits: u64,
	pub misses: u64,
	pub evictions: u64,
}

pub struct FingerprintCache {
	config: CacheConfig,
	inner: Mutex<Inner>,
	stats: Mutex<CacheStats>,
}

pub struct CacheHit {
	pub fingerprint: Fingerprint,
	pub decision: RoutingDecision,
	pub response: Option<GenerateResponse>,
}

impl FingerprintCache {
	pub fn new(config: CacheConfig) -> FingerprintCache {
		FingerprintCache {
			config,
			inner: Mutex::new(Inner::default()),
			stats: Mutex::new(CacheStats::default()),
		}
	}

	pub fn key(&self, request: &GenerateRequest) -> Fingerprint {
		match self.config.strategy {
			CacheKeyStrategy::Exact | CacheKeyStrategy::Hybrid => exact(request),
			CacheKeyStrategy::Semantic => semantic(request),
		}
	}

	pub fn lookup(&self, request: &GenerateRequest) -> Option<CacheHit> {
		if !self.config.enabled {
			return None;
		}
		let primary = self.key(request);
		let hit = self.lookup_key(&primary).or_else(|| {
			// Hybrid falls back to the semantic key when the exact key misses.
			if self.config.strategy == CacheKeyStrategy::Hybrid {
				self.lookup_key(&semantic(request))
			} else {
				None
			}
		});
		let mut stats = self.stats.lock().unwrap();
		if hit.is_some() {
			stats.hits += 1;
		} else {
			stats.misses += 1;
		}
		hit
	}

	fn lookup_key(&self, key: &Fingerprint) -> Option<CacheHit> {
		let mut inner = self.inner.lock().unwrap();
		inner.access_clock += 1;
		let clock = inner.access_clock;
		let expired = inner.map.get(key)?.inserted.elapsed() > self.config.ttl;
		if expired {
			inner.map.remove(key);
			return None;
		}
		let entry = inner.map.get_mut(key)?;
		entry.last_access = clock;
		Some(CacheHit {
			fingerprint: entry.fingerprint.clone(),
			decision: entry.decision.clone(),
			response: entry.response.clone(),
		})
	}

	pub fn store(
		&self,
		request: &GenerateRequest,
		decision: RoutingDecision,
		response: Option<GenerateResponse>,
	) {
		if !self.config.enabled || request.params.stream {
			return;
		}
		let key = self.key(request);
		let mut decision = decision;
		decision.from_cache = true;
		decision.reason = DecisionReason::CacheHit;
		let mut inner = self.inner.lock().unwrap();
		inner.access_clock += 1;
		let clock = inner.access_clock;
		// Hybrid indexes the entry under the semantic key too, so the fallback
		// lookup can land.
		if self.config.strategy == CacheKeyStrategy::Hybrid {
			inner.map.insert(
				semantic(request),
				Entry {
					fingerprint: key.clone(),
					decision: decision.clone(),
					response: response.clone(),
					inserted: Instant::now(),
					last_access: clock,
				},
			);
		}
		inner.map.insert(
			key.clone(),
			Entry {
				fingerprint: key,
				decision,
				response,
				inserted: Instant::now(),
				last_access: clock,
			},
		);
		// LRU eviction past the entry cap.
		while inner.map.len() > self.config.max_entries {
			let Some(oldest) = inner
				.map
				.iter()
				.min_by_key(|(_, e)| e.last_access)
				.map(|(k, _)| k.clone())
			else {
				break;
			};
			inner.map.remove(&oldest);
			self.stats.lock().unwrap().evictions += 1;
		}
	}

	pub fn stats(&self) -> CacheStats {
		let mut stats = *self.stats.lock().unwrap();
		stats.entries = self.inner.lock().unwrap().map.len();
		stats
	}
}
