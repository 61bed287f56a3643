use std::sync::Arc;

use async_trait::async_trait;
use core_types::{
    EngineLifecycleState, ProgressEvent, ProviderClient, ProviderConfig, ProviderError,
    ProviderFactory, ProviderId,
};
use reqwest::Client;
use tokio::sync::{Mutex, broadcast};
use tracing::info;

use crate::gemini::CloudSessionProvider;
use crate::local::{EngineHost, LocalEngineProvider, LocalRuntime, OllamaRuntime};
use crate::openai_compat::CloudStatelessProvider;

type RuntimeFactory = Arc<dyn Fn(&ProviderConfig) -> Arc<dyn LocalRuntime> + Send + Sync>;

struct LocalSlot {
    base_url: String,
    host: Arc<EngineHost>,
}

/// Builds provider clients from explicit configurations.
///
/// A local engine is reused for as long as the selected model stays the same
/// and is torn down when another model is selected. The chat session of the
/// session provider survives switching away and back with unchanged settings.
pub struct ProviderRegistry {
    http: Client,
    progress: broadcast::Sender<ProgressEvent>,
    runtime_factory: RuntimeFactory,
    session: Mutex<Option<Arc<CloudSessionProvider>>>,
    local: Mutex<Option<LocalSlot>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let http = Client::new();
        let runtime_http = http.clone();
        let (progress, _) = broadcast::channel(64);
        Self {
            http,
            progress,
            runtime_factory: Arc::new(move |config: &ProviderConfig| -> Arc<dyn LocalRuntime> {
                Arc::new(OllamaRuntime::new(runtime_http.clone(), config.base_url.clone()))
            }),
            session: Mutex::new(None),
            local: Mutex::new(None),
        }
    }

    pub fn with_local_runtime<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ProviderConfig) -> Arc<dyn LocalRuntime> + Send + Sync + 'static,
    {
        self.runtime_factory = Arc::new(factory);
        self
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub async fn local_state(&self) -> Option<EngineLifecycleState> {
        self.local.lock().await.as_ref().map(|slot| slot.host.state())
    }

    pub async fn shutdown(&self) {
        if let Some(slot) = self.local.lock().await.take() {
            slot.host.shutdown().await;
        }
    }

    async fn session_provider(&self, config: &ProviderConfig) -> Arc<CloudSessionProvider> {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref().filter(|existing| existing.config() == config) {
            return existing.clone();
        }
        info!(model = %config.model, "starting new gemini session");
        let provider = Arc::new(CloudSessionProvider::new(self.http.clone(), config.clone()));
        *session = Some(provider.clone());
        provider
    }

    async fn engine_host(&self, config: &ProviderConfig) -> Arc<EngineHost> {
        let mut local = self.local.lock().await;
        if let Some(slot) = local
            .as_ref()
            .filter(|slot| slot.host.model() == config.model && slot.base_url == config.base_url)
        {
            return slot.host.clone();
        }
        if let Some(previous) = local.take() {
            info!(
                from = previous.host.model(),
                to = %config.model,
                "local model changed, tearing down previous engine"
            );
            previous.host.shutdown().await;
        }
        let host = Arc::new(EngineHost::new(
            config.model.clone(),
            (self.runtime_factory)(config),
            self.progress.clone(),
        ));
        *local = Some(LocalSlot {
            base_url: config.base_url.clone(),
            host: host.clone(),
        });
        host
    }
}

#[async_trait]
impl ProviderFactory for ProviderRegistry {
    async fn activate(
        &self,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        match config.id {
            ProviderId::Gemini => Ok(self.session_provider(config).await),
            ProviderId::Groq => Ok(Arc::new(CloudStatelessProvider::new(
                self.http.clone(),
                config.clone(),
            ))),
            ProviderId::Local => {
                let host = self.engine_host(config).await;
                Ok(Arc::new(LocalEngineProvider::with_host(config.clone(), host)))
            }
        }
    }
}
