use std::sync::Arc;

use async_trait::async_trait;
use core_types::{ProgressEvent, ProviderError};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

/// Publishes the progress of one engine load.
///
/// Fractions never go backwards within a load, even when the runtime reports
/// per-layer progress that restarts at zero.
#[derive(Clone)]
pub struct ProgressSink {
    tx: broadcast::Sender<ProgressEvent>,
    high_water: Arc<Mutex<f32>>,
}

impl ProgressSink {
    pub fn new(tx: broadcast::Sender<ProgressEvent>) -> Self {
        Self {
            tx,
            high_water: Arc::new(Mutex::new(0.0)),
        }
    }

    pub fn report(&self, stage: impl Into<String>, fraction: f32) {
        let fraction = {
            let mut high_water = self.high_water.lock();
            // keep below 1.0: only `finish` may close a load
            let fraction = fraction.clamp(0.0, 0.99).max(*high_water);
            *high_water = fraction;
            fraction
        };
        self.publish(ProgressEvent::new(stage, fraction));
    }

    pub fn finish(&self, stage: impl Into<String>) {
        *self.high_water.lock() = 1.0;
        self.publish(ProgressEvent::finished(stage));
    }

    pub fn fail(&self, stage: impl Into<String>) {
        let fraction = *self.high_water.lock();
        self.publish(ProgressEvent::failed(stage, fraction));
    }

    fn publish(&self, event: ProgressEvent) {
        trace!(stage = %event.stage, fraction = event.fraction, "engine progress");
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTurn {
    pub role: &'static str,
    pub content: String,
    /// Base64 images, for vision capable models only.
    pub images: Vec<String>,
}

impl LocalTurn {
    pub fn new(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalChatRequest {
    pub messages: Vec<LocalTurn>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait LocalRuntime: Send + Sync {
    async fn load(
        &self,
        model: &str,
        progress: ProgressSink,
    ) -> Result<Arc<dyn LocalEngine>, ProviderError>;
}

/// A loaded model. Calls are serialized by the owning provider.
#[async_trait]
pub trait LocalEngine: Send + Sync {
    async fn chat(&self, request: LocalChatRequest) -> Result<String, ProviderError>;

    async fn unload(&self) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_monotonic_until_finish() {
        let (tx, mut rx) = broadcast::channel(16);
        let sink = ProgressSink::new(tx);

        sink.report("layer a", 0.6);
        sink.report("layer b", 0.1);
        sink.report("overshoot", 3.0);
        sink.finish("Finish loading");

        let fractions: Vec<f32> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|event| event.fraction)
            .collect();
        assert_eq!(fractions, vec![0.6, 0.6, 0.99, 1.0]);
    }

    #[test]
    fn failure_is_terminal_at_last_fraction() {
        let (tx, mut rx) = broadcast::channel(4);
        let sink = ProgressSink::new(tx);
        sink.report("Fetching", 0.4);
        sink.fail("Failed to load");

        let _ = rx.try_recv();
        let last = rx.try_recv().expect("failure event");
        assert!(last.terminal);
        assert_eq!(last.fraction, 0.4);
    }

    #[test]
    fn reporting_without_subscribers_is_harmless() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        ProgressSink::new(tx).report("Fetching", 0.2);
    }
}
