//! Drain coordinates graceful shutdown between a single trigger and any number
//! of watchers. Components clone a [`DrainWatcher`], await [`DrainWatcher::signaled`],
//! perform their cleanup, and drop the returned [`DrainRelease`]. The trigger's
//! [`DrainTrigger::start_drain_and_wait`] resolves once every watcher has released.

use tokio::sync::{mpsc, watch};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
	/// Signal watchers and return without waiting for them.
	Immediate,
	/// Signal watchers and wait until all of them have released.
	Graceful,
}

pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(false);
	let (alive_tx, alive_rx) = mpsc::channel(1);
	(
		DrainTrigger {
			signal: signal_tx,
			released: alive_rx,
		},
		DrainWatcher {
			signal: signal_rx,
			alive: alive_tx,
		},
	)
}

pub struct DrainTrigger {
	signal: watch::Sender<bool>,
	released: mpsc::Receiver<()>,
}

impl DrainTrigger {
	pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
		let _ = self.signal.send(true);
		if mode == DrainMode::Immediate {
			return;
		}
		// recv returns None once every DrainWatcher (and DrainRelease) is dropped.
		let _ = self.released.recv().await;
		debug!("drain complete");
	}
}

#[derive(Clone)]
pub struct DrainWatcher {
	signal: watch::Receiver<bool>,
	alive: mpsc::Sender<()>,
}

impl DrainWatcher {
	/// Wait for the drain to be triggered. The returned guard must be held for the
	/// duration of cleanup; dropping it tells the trigger this watcher is done.
	pub async fn signaled(mut self) -> DrainRelease {
		let _ = self.signal.wait_for(|draining| *draining).await;
		DrainRelease(self.alive)
	}

	/// Whether a drain has been triggered, without waiting.
	pub fn is_draining(&self) -> bool {
		*self.signal.borrow()
	}
}

/// Held by a watcher while it cleans up; dropping it releases the trigger.
pub struct DrainRelease(#[allow(dead_code)] mpsc::Sender<()>);

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::sync::atomic::{AtomicBool, Ordering};

	#[tokio::test]
	async fn waits_for_all_watchers() {
		let (trigger, watcher) = new();
		let done = Arc::new(AtomicBool::new(false));

		let d1 = done.clone();
		let w1 = watcher.clone();
		let h = tokio::spawn(async move {
			let release = w1.signaled().await;
			tokio::time::sleep(std::time::Duration::from_millis(20)).await;
			d1.store(true, Ordering::SeqCst);
			drop(release);
		});
		drop(watcher);

		trigger.start_drain_and_wait(DrainMode::Graceful).await;
		assert!(done.load(Ordering::SeqCst));
		h.await.unwrap();
	}

	#[tokio::test]
	async fn immediate_does_not_wait() {
		let (trigger, watcher) = new();
		trigger.start_drain_and_wait(DrainMode::Immediate).await;
		assert!(watcher.is_draining());
	}
}
