//! Channel-backed cancellable chunk sequences. A stream produces chunks and
//! terminates with end-of-stream or a terminal error; consumers can cancel at
//! any point and recover from retryable stream errors by reconnecting.

use std::pin::Pin;
use std::task::{Context, Poll};

use a2a_wire::A2aError;
use fabric_core::prelude::*;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::provider::{DispatchContext, GenerateRequest, ModelProvider, StreamChunk};

pub struct ChunkStream {
	inner: Pin<Box<dyn Stream<Item = Result<StreamChunk, A2aError>> + Send>>,
	cancel: CancellationToken,
}

impl ChunkStream {
	pub fn new(
		inner: Pin<Box<dyn Stream<Item = Result<StreamChunk, A2aError>> + Send>>,
	) -> ChunkStream {
		ChunkStream {
			inner,
			cancel: CancellationToken::new(),
		}
	}

	/// Build a stream fed by a producer task through a bounded channel. The
	/// returned token lets the producer observe consumer-side cancellation.
	pub fn channel(capacity: usize) -> (mpsc::Sender<Result<StreamChunk, A2aError>>, ChunkStream) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		let stream = ChunkStream::new(Box::pin(ReceiverStream::new(rx)));
		(tx, stream)
	}

	pub fn cancellation_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// Stop the sequence; subsequent polls yield end-of-stream.
	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	pub async fn next(&mut self) -> Option<Result<StreamChunk, A2aError>> {
		futures::StreamExt::next(self).await
	}

	/// Drain the remainder into a vector, stopping at the terminal error if one
	/// arrives.
	pub async fn collect_remaining(mut self) -> Result<Vec<StreamChunk>, A2aError> {
		let mut chunks = Vec::new();
		while let Some(item) = self.next().await {
			chunks.push(item?);
		}
		Ok(chunks)
	}
}

impl Stream for ChunkStream {
	type Item = Result<StreamChunk, A2aError>;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		if self.cancel.is_cancelled() {
			return Poll::Ready(None);
		}
		self.inner.as_mut().poll_next(cx)
	}
}

/// Wrap a provider stream with consumer-side recovery: on a retryable stream
/// error, reconnect with linear backoff (1 s × attempt) up to `max_reconnects`
/// times. Chunks already delivered are never redelivered; the provider resumes
/// from the attempt counter in the dispatch context.
pub fn with_recovery(
	provider: Arc<dyn ModelProvider>,
	request: GenerateRequest,
	max_reconnects: u32,
	reconnect_delay_unit: Duration,
) -> ChunkStream {
	let stream = async_stream::stream! {
		let mut attempt: u32 = 0;
		'outer: loop {
			let ctx = DispatchContext { attempt };
			let mut inner = match provider.generate_stream(&request, &ctx).await {
				Ok(stream) => stream,
				Err(e) => {
					if e.retryable() && attempt < max_reconnects {
						attempt += 1;
						debug!(attempt, "stream connect failed, reconnecting: {e}");
						tokio::time::sleep(reconnect_delay_unit * attempt).await;
						continue 'outer;
					}
					yield Err(e);
					break 'outer;
				},
			};
			loop {
				match inner.next().await {
					Some(Ok(chunk)) => yield Ok(chunk),
					Some(Err(e)) => {
						if e.retryable() && attempt < max_reconnects {
							attempt += 1;
							debug!(attempt, "stream interrupted, reconnecting: {e}");
							tokio::time::sleep(reconnect_delay_unit * attempt).await;
							continue 'outer;
						}
						yield Err(e);
						break 'outer;
					},
					None => break 'outer,
				}
			}
		}
	};
	ChunkStream::new(Box::pin(stream))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::router::provider::{GenerateResponse, ProviderSpec};
	use async_trait::async_trait;
	use std::sync::atomic::{AtomicU32, Ordering};

	/// Streams chunks, injecting one retryable interruption partway through on
	/// the first attempt. Resumes from the chunk index implied by the attempt.
	struct InterruptedProvider {
		connects: AtomicU32,
	}

	#[async_trait]
	impl ModelProvider for InterruptedProvider {
		fn spec(&self) -> ProviderSpec {
			ProviderSpec {
				id: strng::new("interrupted"),
				cost_per_1k_tokens: 1.0,
				multimodal: false,
				long_context: false,
				quality: 0.5,
			}
		}

		async fn generate(
			&self,
			_request: &GenerateRequest,
			_ctx: &DispatchContext,
		) -> Result<GenerateResponse, A2aError> {
			Err(A2aError::internal("not used"))
		}

		async fn generate_stream(
			&self,
			_request: &GenerateRequest,
			ctx: &DispatchContext,
		) -> Result<ChunkStream, A2aError> {
			self.connects.fetch_add(1, Ordering::SeqCst);
			let attempt = ctx.attempt;
			let (tx, stream) = ChunkStream::channel(8);
			tokio::spawn(async move {
				if attempt == 0 {
					let _ = tx.send(Ok(StreamChunk { content: "a".into(), index: 0 })).await;
					let _ = tx.send(Ok(StreamChunk { content: "b".into(), index: 1 })).await;
					let _ = tx.send(Err(A2aError::routing("stream cut"))).await;
				} else {
					// Resumed: continue past the chunks already delivered.
					let _ = tx.send(Ok(StreamChunk { content: "c".into(), index: 2 })).await;
				}
			});
			Ok(stream)
		}
	}

	#[tokio::test]
	async fn recovery_resumes_without_redelivery() {
		let provider = Arc::new(InterruptedProvider {
			connects: AtomicU32::new(0),
		});
		let stream = with_recovery(
			provider.clone(),
			GenerateRequest::text("hello"),
			3,
			Duration::from_millis(5),
		);
		let chunks = stream.collect_remaining().await.unwrap();
		let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
		assert_eq!(contents, vec!["a", "b", "c"]);
		assert_eq!(provider.connects.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn exhausted_reconnects_surface_terminal_error() {
		struct AlwaysCut;

		#[async_trait]
		impl ModelProvider for AlwaysCut {
			fn spec(&self) -> ProviderSpec {
				ProviderSpec {
					id: strng::new("cut"),
					cost_per_1k_tokens: 1.0,
					multimodal: false,
					long_context: false,
					quality: 0.5,
				}
			}

			async fn generate(
				&self,
				_request: &GenerateRequest,
				_ctx: &DispatchContext,
			) -> Result<GenerateResponse, A2aError> {
				Err(A2aError::internal("not used"))
			}

			async fn generate_stream(
				&self,
				_request: &GenerateRequest,
				_ctx: &DispatchContext,
			) -> Result<ChunkStream, A2aError> {
				let (tx, stream) = ChunkStream::channel(2);
				tokio::spawn(async move {
					let _ = tx
						.send(Ok(StreamChunk { content: "x".into(), index: 0 }))
						.await;
					let _ = tx.send(Err(A2aError::routing("cut again"))).await;
				});
				Ok(stream)
			}
		}

		let mut stream = with_recovery(
			Arc::new(AlwaysCut),
			GenerateRequest::text("hi"),
			1,
			Duration::from_millis(1),
		);
		// Partial chunks remain valid; the stream ends with the terminal error.
		let mut delivered = 0;
		let mut terminal = None;
		while let Some(item) = stream.next().await {
			match item {
				Ok(_) => delivered += 1,
				Err(e) => {
					terminal = Some(e);
					break;
				},
			}
		}
		assert_eq!(delivered, 2);
		assert_eq!(terminal.unwrap().kind, a2a_wire::ErrorKind::Routing);
	}

	#[tokio::test]
	async fn cancellation_ends_stream() {
		let (tx, mut stream) = ChunkStream::channel(2);
		tx.send(Ok(StreamChunk { content: "x".into(), index: 0 }))
			.await
			.unwrap();
		stream.cancel();
		assert!(stream.next().await.is_none());
		drop(tx);
	}
}
