//! In-process restart after a config change.
//!
//! The handle cancels the current runtime generation. `main` sees
//! [`RestartHandle::is_requested`] once the generation's tasks have drained
//! and starts a new one with freshly loaded config.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone)]
pub struct RestartHandle {
    generation: CancellationToken,
    requested: Arc<AtomicBool>,
}

impl RestartHandle {
    /// `generation` is cancelled when the restart fires.
    pub fn new(generation: CancellationToken) -> Self {
        Self {
            generation,
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Restart after `delay` so the triggering reply can reach the client.
    pub fn schedule(&self, delay: Duration) {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.fire();
        });
    }

    /// Restart now.
    pub fn fire(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            info!("[Restart] Restarting runtime");
        }
        self.generation.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> &CancellationToken {
        &self.generation
    }
}
