use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use a2a_wire::A2aError;
use async_trait::async_trait;
use fabric_core::prelude::*;
use tokio::sync::{mpsc, oneshot};

/// Flushes one accumulated batch. Responses are keyed by the ids assigned at
/// submission; a missing key fails that caller only.
#[async_trait]
pub trait BatchHandler<T: Send, R: Send>: Send + Sync {
	async fn flush(&self, batch: Vec<(u64, T)>) -> HashMap<u64, Result<R, A2aError>>;
}

struct Item<T, R> {
	id: u64,
	payload: T,
	reply: oneshot::Sender<Result<R, A2aError>>,
}

/// Per-tool request batcher: collects submissions and flushes when `batch_size`
/// is reached or `max_wait` elapses, whichever is first. The submission queue
/// is bounded by the batch size.
pub struct Batcher<T: Send + 'static, R: Send + 'static> {
	tx: mpsc::Sender<Item<T, R>>,
	seq: AtomicU64,
}

impl<T: Send + 'static, R: Send + 'static> Batcher<T, R> {
	pub fn new(
		batch_size: usize,
		max_wait: Duration,
		handler: Arc<dyn BatchHandler<T, R>>,
	) -> Batcher<T, R> {
		let (tx, mut rx) = mpsc::channel::<Item<T, R>>(batch_size.max(1));
		tokio::spawn(async move {
			loop {
				let Some(first) = rx.recv().await else {
					return;
				};
				let mut buf = vec![first];
				let deadline = tokio::time::Instant::now() + max_wait;
				while buf.len() < batch_size {
					tokio::select! {
						_ = tokio::time::sleep_until(deadline) => break,
						item = rx.recv() => match item {
							Some(item) => buf.push(item),
							None => break,
						},
					}
				}

				let mut batch = Vec::with_capacity(buf.len());
				let mut replies = Vec::with_capacity(buf.len());
				for item in buf {
					batch.push((item.id, item.payload));
					replies.push((item.id, item.reply));
				}
				debug!(size = batch.len(), "flushing batch");
				let mut results = handler.flush(batch).await;
				for (id, reply) in replies {
					let result = results.remove(&id).unwrap_or_else(|| {
						Err(
							A2aError::internal("batch flush produced no response for this request")
								.with_component("shell"),
						)
					});
					let _ = reply.send(result);
				}
			}
		});
		Batcher {
			tx,
			seq: AtomicU64::new(0),
		}
	}

	pub async fn submit(&self, payload: T) -> Result<R, A2aError> {
		let id = self.seq.fetch_add(1, Ordering::Relaxed);
		let (reply_tx, reply_rx) = oneshot::channel();
		self
			.tx
			.send(Item {
				id,
				payload,
				reply: reply_tx,
			})
			.await
			.map_err(|_| A2aError::unavailable("batcher is stopped").with_component("shell"))?;
		reply_rx
			.await
			.map_err(|_| A2aError::internal("batch flush dropped the reply").with_component("shell"))?
	}
}
