mod ollama;
mod runtime;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use core_types::{
    Attachment, Capabilities, EngineLifecycleState, Message, ProgressEvent, ProviderClient,
    ProviderConfig, ProviderError, ProviderId, Role, StructuredResponse,
};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub use ollama::OllamaRuntime;
pub use runtime::{LocalChatRequest, LocalEngine, LocalRuntime, LocalTurn, ProgressSink};

use crate::capability::check_attachment;
use crate::normalize::{FallbackProfile, normalize};
use crate::prompt::{SYSTEM_PROMPT, compose_user_text};

pub(crate) const FINISH_STAGE: &str = "Finish loading";

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<dyn LocalEngine>, ProviderError>>>;

enum Slot {
    Uninitialized,
    Loading { generation: u64, load: LoadFuture },
    Ready(Arc<dyn LocalEngine>),
    Failed,
}

pub(crate) struct EngineHost {
    model: String,
    runtime: Arc<dyn LocalRuntime>,
    progress: broadcast::Sender<ProgressEvent>,
    slot: Mutex<Slot>,
    generation: AtomicU64,
    inference: tokio::sync::Mutex<()>,
}

impl EngineHost {
    pub(crate) fn new(
        model: impl Into<String>,
        runtime: Arc<dyn LocalRuntime>,
        progress: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            model: model.into(),
            runtime,
            progress,
            slot: Mutex::new(Slot::Uninitialized),
            generation: AtomicU64::new(0),
            inference: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn model(&self) -> &str {
        &self.model
    }

    pub(crate) fn state(&self) -> EngineLifecycleState {
        match &*self.slot.lock() {
            Slot::Uninitialized => EngineLifecycleState::Uninitialized,
            Slot::Loading { .. } => EngineLifecycleState::Loading,
            Slot::Ready(_) => EngineLifecycleState::Ready,
            Slot::Failed => EngineLifecycleState::Failed,
        }
    }

    /// Concurrent callers share one load and therefore one progress stream.
    /// A failed load may be retried by the next caller.
    pub(crate) async fn ensure_ready(&self) -> Result<Arc<dyn LocalEngine>, ProviderError> {
        let (generation, load) = {
            let mut slot = self.slot.lock();
            match &*slot {
                Slot::Ready(engine) => return Ok(engine.clone()),
                Slot::Loading { generation, load } => (*generation, load.clone()),
                Slot::Uninitialized | Slot::Failed => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let load = self.start_load();
                    *slot = Slot::Loading {
                        generation,
                        load: load.clone(),
                    };
                    (generation, load)
                }
            }
        };

        let result = load.await;
        let current = {
            let mut slot = self.slot.lock();
            let current = matches!(
                &*slot,
                Slot::Loading { generation: current, .. } if *current == generation
            );
            if current {
                *slot = match &result {
                    Ok(engine) => Slot::Ready(engine.clone()),
                    Err(_) => Slot::Failed,
                };
            }
            current
        };
        if current {
            return result;
        }

        // a shutdown during the load wins
        if let Ok(engine) = result {
            warn!(model = %self.model, "engine finished loading after shutdown, unloading it");
            if let Err(err) = engine.unload().await {
                warn!(model = %self.model, "failed to unload local engine: {err}");
            }
        }
        Err(ProviderError::EngineLoad("engine was shut down".to_string()))
    }

    fn start_load(&self) -> LoadFuture {
        let runtime = self.runtime.clone();
        let model = self.model.clone();
        let sink = ProgressSink::new(self.progress.clone());
        async move {
            info!(model = %model, "initializing local engine");
            sink.report("Initializing...", 0.0);
            match runtime.load(&model, sink.clone()).await {
                Ok(engine) => {
                    sink.finish(FINISH_STAGE);
                    info!(model = %model, "local engine ready");
                    Ok(engine)
                }
                Err(err) => {
                    error!(model = %model, "local engine failed to load: {err}");
                    sink.fail(format!("Failed to load {model}"));
                    Err(match err {
                        ProviderError::EngineLoad(_) | ProviderError::NotFound { .. } => err,
                        other => ProviderError::EngineLoad(other.to_string()),
                    })
                }
            }
        }
        .boxed()
        .shared()
    }

    pub(crate) async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock(), Slot::Uninitialized);
        if let Slot::Ready(engine) = previous {
            let _turn = self.inference.lock().await;
            if let Err(err) = engine.unload().await {
                warn!(model = %self.model, "failed to unload local engine: {err}");
            }
        }
    }
}

/// The engine is loaded lazily on the first send; capability checks never trigger a load.
pub struct LocalEngineProvider {
    config: ProviderConfig,
    host: Arc<EngineHost>,
}

impl LocalEngineProvider {
    pub fn new(
        config: ProviderConfig,
        runtime: Arc<dyn LocalRuntime>,
        progress: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        let host = Arc::new(EngineHost::new(config.model.clone(), runtime, progress));
        Self { config, host }
    }

    pub(crate) fn with_host(config: ProviderConfig, host: Arc<EngineHost>) -> Self {
        Self { config, host }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub async fn initialize(&self) -> Result<(), ProviderError> {
        self.host.ensure_ready().await.map(|_| ())
    }

    pub async fn shutdown(&self) {
        self.host.shutdown().await;
    }
}

#[async_trait]
impl ProviderClient for LocalEngineProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Local
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn capabilities(&self) -> Capabilities {
        self.config.capabilities()
    }

    async fn send(
        &self,
        history: &[Message],
        user_text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<StructuredResponse, ProviderError> {
        if let Some(notice) = check_attachment(
            self.capabilities(),
            attachment,
            &format!("when running locally ({} is text-only)", self.config.model),
            ProviderId::Gemini,
        ) {
            return Ok(notice);
        }

        let engine = self.host.ensure_ready().await?;
        let request = build_request(&self.config, history, user_text, attachment);
        let raw = {
            let _turn = self.host.inference.lock().await;
            engine.chat(request).await?
        };
        Ok(normalize(&raw, FallbackProfile::LOCAL_ENGINE))
    }

    fn lifecycle(&self) -> Option<EngineLifecycleState> {
        Some(self.host.state())
    }
}

fn build_request(
    config: &ProviderConfig,
    history: &[Message],
    user_text: &str,
    attachment: Option<&Attachment>,
) -> LocalChatRequest {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(LocalTurn::new("system", SYSTEM_PROMPT));
    messages.extend(history.iter().map(|message| {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        LocalTurn::new(role, message.plain_text())
    }));

    let mut turn = LocalTurn::new("user", compose_user_text(user_text, attachment));
    if let Some(payload) = attachment.and_then(Attachment::base64_payload) {
        turn.images.push(payload.to_string());
    }
    messages.push(turn);

    LocalChatRequest {
        messages,
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capability::SYSTEM_WARNING_SOURCE;
    use crate::test_support::{FakeRuntime, STRUCTURED_ANSWER, provider_config};

    fn local(runtime: Arc<FakeRuntime>, model: &str) -> (LocalEngineProvider, broadcast::Receiver<ProgressEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let config = provider_config(ProviderId::Local, "http://localhost:11434", model);
        (LocalEngineProvider::new(config, runtime, tx), rx)
    }

    fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn concurrent_sends_share_one_load() {
        let runtime = Arc::new(FakeRuntime::new(STRUCTURED_ANSWER));
        let (provider, mut rx) = local(runtime.clone(), "llama3:8b");
        assert_eq!(provider.lifecycle(), Some(EngineLifecycleState::Uninitialized));

        let (first, second) = tokio::join!(
            provider.send(&[], "Capital of France?", None),
            provider.send(&[], "Capital of Spain?", None),
        );
        assert_eq!(first.expect("first").confidence_score, 97);
        assert_eq!(second.expect("second").confidence_score, 97);

        assert_eq!(runtime.loads(), 1);
        assert_eq!(runtime.engine.requests.lock().len(), 2);
        assert_eq!(provider.lifecycle(), Some(EngineLifecycleState::Ready));

        let events = drain(&mut rx);
        let terminal: Vec<_> = events.iter().filter(|event| event.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].stage, FINISH_STAGE);
        assert_eq!(events.first().map(|event| event.fraction), Some(0.0));
    }

    #[tokio::test]
    async fn image_on_text_only_model_never_loads_engine() {
        let runtime = Arc::new(FakeRuntime::new(STRUCTURED_ANSWER));
        let (provider, _rx) = local(runtime.clone(), "llama3:8b");
        let image = Attachment::binary("cat.png", "image/png", "data:image/png;base64,iVBORw==");

        let notice = provider
            .send(&[], "What is this?", Some(&image))
            .await
            .expect("notice");
        assert_eq!(notice.sources, vec![SYSTEM_WARNING_SOURCE]);
        assert_eq!(notice.confidence_score, 100);
        assert!(notice.text.contains("Gemini (Cloud)"));
        assert_eq!(runtime.loads(), 0);
        assert_eq!(provider.lifecycle(), Some(EngineLifecycleState::Uninitialized));
    }

    #[tokio::test]
    async fn vision_model_receives_image_payload() {
        let runtime = Arc::new(FakeRuntime::new(STRUCTURED_ANSWER));
        let (provider, _rx) = local(runtime.clone(), "llava:7b");
        let image = Attachment::binary("cat.png", "image/png", "data:image/png;base64,iVBORw==");

        provider
            .send(&[], "What is this?", Some(&image))
            .await
            .expect("send");
        let requests = runtime.engine.requests.lock();
        let turn = requests[0].messages.last().expect("user turn");
        assert_eq!(turn.images, vec!["iVBORw==".to_string()]);
    }

    #[tokio::test]
    async fn failed_load_can_be_retried() {
        let runtime = Arc::new(FakeRuntime::failing(STRUCTURED_ANSWER, 1));
        let (provider, mut rx) = local(runtime.clone(), "llama3:8b");

        let err = provider.send(&[], "Hi", None).await.expect_err("load fails");
        assert!(matches!(err, ProviderError::EngineLoad(_)));
        assert_eq!(provider.lifecycle(), Some(EngineLifecycleState::Failed));
        let failure = drain(&mut rx).pop().expect("failure event");
        assert!(failure.terminal);
        assert!(failure.fraction < 1.0);

        provider.send(&[], "Hi again", None).await.expect("retry succeeds");
        assert_eq!(runtime.loads(), 2);
        assert_eq!(provider.lifecycle(), Some(EngineLifecycleState::Ready));
    }

    #[tokio::test]
    async fn history_is_replayed_after_system_prompt() {
        let runtime = Arc::new(FakeRuntime::new("not json at all"));
        let (provider, _rx) = local(runtime.clone(), "llama3:8b");
        let history = vec![
            Message::user("Hello"),
            Message::assistant(StructuredResponse::new("Hi!", Vec::new(), 80.0)),
        ];

        let response = provider.send(&history, "Thanks", None).await.expect("send");
        assert_eq!(response.sources, vec!["Local Knowledge"]);
        assert_eq!(response.confidence_score, 80);

        let requests = runtime.engine.requests.lock();
        let roles: Vec<_> = requests[0].messages.iter().map(|turn| turn.role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(requests[0].messages[2].content, "Hi!");
    }

    #[tokio::test]
    async fn inference_calls_never_overlap() {
        let runtime = Arc::new(FakeRuntime::new(STRUCTURED_ANSWER));
        let (provider, _rx) = local(runtime.clone(), "llama3:8b");

        let (a, b, c) = tokio::join!(
            provider.send(&[], "One", None),
            provider.send(&[], "Two", None),
            provider.send(&[], "Three", None),
        );
        a.expect("first");
        b.expect("second");
        c.expect("third");

        assert_eq!(runtime.engine.requests.lock().len(), 3);
        assert_eq!(runtime.engine.peak_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_during_load_unloads_the_late_engine() {
        let runtime = Arc::new(FakeRuntime::slow(STRUCTURED_ANSWER, Duration::from_millis(200)));
        let (provider, _rx) = local(runtime.clone(), "llama3:8b");

        let (sent, ()) = tokio::join!(provider.send(&[], "Hi", None), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            provider.shutdown().await;
        });

        let err = sent.expect_err("engine was shut down mid-load");
        assert!(matches!(err, ProviderError::EngineLoad(_)));
        assert_eq!(runtime.engine.unloads.load(Ordering::SeqCst), 1);
        assert!(runtime.engine.requests.lock().is_empty());
        assert_eq!(provider.lifecycle(), Some(EngineLifecycleState::Uninitialized));
    }

    #[tokio::test]
    async fn shutdown_unloads_and_resets() {
        let runtime = Arc::new(FakeRuntime::new(STRUCTURED_ANSWER));
        let (provider, _rx) = local(runtime.clone(), "llama3:8b");
        provider.initialize().await.expect("initialize");

        provider.shutdown().await;
        assert_eq!(runtime.engine.unloads.load(Ordering::SeqCst), 1);
        assert_eq!(provider.lifecycle(), Some(EngineLifecycleState::Uninitialized));
    }
}
