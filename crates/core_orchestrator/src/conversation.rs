use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use attachments::PendingAttachment;
use core_types::{
    Message, ProviderClient, ProviderConfig, ProviderError, ProviderFactory, ProviderId,
    RecognitionEvent, SpeechInput, SpeechOutput, StructuredResponse,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::retry::RetryController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Text,
    Voice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Busy,
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Answered(StructuredResponse),
    Failed(ProviderError),
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    MessageAppended(Message),
    ProcessingChanged(bool),
    Retrying { attempt: u32, delay: Duration },
    ListeningChanged(bool),
    Transcript(String),
    ProviderChanged(ProviderId),
}

#[derive(Default)]
struct ConversationState {
    provider: Option<Arc<dyn ProviderClient>>,
    messages: Vec<Message>,
    pending: PendingAttachment,
    input_mode: InputMode,
    listening: bool,
    transcript: String,
}

pub struct Orchestrator {
    factory: Arc<dyn ProviderFactory>,
    speech_out: Arc<dyn SpeechOutput>,
    speech_in: Arc<dyn SpeechInput>,
    retry: RetryController,
    processing: AtomicBool,
    state: Mutex<ConversationState>,
    events: broadcast::Sender<ConversationEvent>,
}

impl Orchestrator {
    pub fn new(
        factory: Arc<dyn ProviderFactory>,
        speech_out: Arc<dyn SpeechOutput>,
        speech_in: Arc<dyn SpeechInput>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            factory,
            speech_out,
            speech_in,
            retry: RetryController::default(),
            processing: AtomicBool::new(false),
            state: Mutex::new(ConversationState::default()),
            events,
        }
    }

    pub fn with_retry(mut self, retry: RetryController) -> Self {
        self.retry = retry;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// A send already in flight finishes against the provider it started with.
    pub async fn configure(&self, config: ProviderConfig) -> Result<(), ProviderError> {
        let provider = self.factory.activate(&config).await?;
        info!(provider = %config.id, model = %config.model, "provider configured");
        self.state.lock().provider = Some(provider);
        self.emit(ConversationEvent::ProviderChanged(config.id));
        Ok(())
    }

    pub fn active_provider(&self) -> Option<ProviderId> {
        self.state.lock().provider.as_ref().map(|provider| provider.id())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    pub fn input_mode(&self) -> InputMode {
        self.state.lock().input_mode
    }

    pub fn is_listening(&self) -> bool {
        self.state.lock().listening
    }

    pub fn attach(&self, path: impl Into<PathBuf>) -> Option<PathBuf> {
        self.state.lock().pending.set(path)
    }

    pub fn detach(&self) -> Option<PathBuf> {
        self.state.lock().pending.take()
    }

    pub fn pending_attachment(&self) -> Option<PathBuf> {
        self.state.lock().pending.path().map(PathBuf::from)
    }

    pub async fn submit(&self, text: &str) -> SendOutcome {
        let text = text.trim();
        if text.is_empty() && self.state.lock().pending.is_empty() {
            return SendOutcome::Rejected(RejectReason::Empty);
        }
        let Some(_busy) = BusyGuard::acquire(&self.processing, &self.events) else {
            debug!("send rejected: another message is in flight");
            return SendOutcome::Rejected(RejectReason::Busy);
        };

        let (provider, path, history) = {
            let mut state = self.state.lock();
            (
                state.provider.clone(),
                state.pending.take(),
                state.messages.clone(),
            )
        };
        let attachment = attachments::resolve(path).await;
        if text.is_empty() && attachment.is_none() {
            return SendOutcome::Rejected(RejectReason::Empty);
        }

        let recorded = match &attachment {
            Some(file) => format!("[Attached: {}]\n{text}", file.name),
            None => text.to_string(),
        };
        self.append(Message::user(recorded));

        let result = match provider {
            Some(provider) => {
                debug!(
                    provider = %provider.id(),
                    model = provider.model(),
                    history = history.len(),
                    attachment = attachment.as_ref().map(|file| file.name.as_str()),
                    "dispatching message"
                );
                self.retry
                    .run(
                        provider.id(),
                        || provider.send(&history, text, attachment.as_ref()),
                        |attempt, delay| self.emit(ConversationEvent::Retrying { attempt, delay }),
                    )
                    .await
            }
            None => Err(ProviderError::provider(
                "No provider is selected. Please choose one in Settings.",
            )),
        };

        match result {
            Ok(response) => {
                self.append(Message::assistant(response.clone()));
                self.speak_if_voice(&response.text);
                SendOutcome::Answered(response)
            }
            Err(err) => {
                error!(kind = err.kind(), "send failed: {err}");
                let failure = StructuredResponse::failure(&err);
                self.append(Message::assistant(failure.clone()));
                self.speak_if_voice(&failure.text);
                SendOutcome::Failed(err)
            }
        }
    }

    /// Leaving voice mode cancels listening and any speech in progress.
    pub fn set_input_mode(&self, mode: InputMode) {
        let stop_listening = {
            let mut state = self.state.lock();
            if state.input_mode == mode {
                return;
            }
            state.input_mode = mode;
            let was_listening = mode == InputMode::Text && state.listening;
            if mode == InputMode::Text {
                state.listening = false;
                state.transcript.clear();
            }
            was_listening
        };
        info!(?mode, "input mode changed");
        if mode == InputMode::Text {
            if stop_listening {
                self.speech_in.stop_listening();
                self.emit(ConversationEvent::ListeningChanged(false));
            }
            self.speech_out.cancel();
        }
    }

    /// Starts recognition, silencing speech output first. Implies voice mode.
    pub fn start_listening(&self) -> anyhow::Result<()> {
        if self.speech_out.is_speaking() {
            self.speech_out.cancel();
        }
        {
            let mut state = self.state.lock();
            if state.listening {
                return Ok(());
            }
            state.input_mode = InputMode::Voice;
            state.transcript.clear();
        }
        self.speech_in.start_listening()?;
        self.state.lock().listening = true;
        self.emit(ConversationEvent::ListeningChanged(true));
        Ok(())
    }

    /// Asks the recognizer to stop; the transcript is sent once it reports `Ended`.
    pub fn stop_listening(&self) {
        if self.is_listening() {
            self.speech_in.stop_listening();
        }
    }

    pub fn toggle_listening(&self) -> anyhow::Result<()> {
        if self.is_listening() {
            self.stop_listening();
            Ok(())
        } else {
            self.start_listening()
        }
    }

    /// Feed a recognizer event. A non-empty transcript is sent exactly once, when listening ends.
    pub async fn on_recognition(&self, event: RecognitionEvent) -> Option<SendOutcome> {
        match event {
            RecognitionEvent::Interim(text) | RecognitionEvent::Final(text) => {
                {
                    let mut state = self.state.lock();
                    if !state.listening {
                        return None;
                    }
                    state.transcript = text.clone();
                }
                self.emit(ConversationEvent::Transcript(text));
                None
            }
            RecognitionEvent::Ended => {
                let transcript = {
                    let mut state = self.state.lock();
                    if !state.listening {
                        return None;
                    }
                    state.listening = false;
                    std::mem::take(&mut state.transcript)
                };
                self.emit(ConversationEvent::ListeningChanged(false));
                if transcript.trim().is_empty() {
                    return None;
                }
                Some(self.submit(&transcript).await)
            }
        }
    }

    fn speak_if_voice(&self, text: &str) {
        if self.input_mode() == InputMode::Voice {
            self.speech_out.speak(text);
        }
    }

    fn append(&self, message: Message) {
        self.state.lock().messages.push(message.clone());
        self.emit(ConversationEvent::MessageAppended(message));
    }

    fn emit(&self, event: ConversationEvent) {
        let _ = self.events.send(event);
    }
}

struct BusyGuard<'a> {
    flag: &'a AtomicBool,
    events: &'a broadcast::Sender<ConversationEvent>,
}

impl<'a> BusyGuard<'a> {
    fn acquire(
        flag: &'a AtomicBool,
        events: &'a broadcast::Sender<ConversationEvent>,
    ) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let _ = events.send(ConversationEvent::ProcessingChanged(true));
        Some(Self { flag, events })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        let _ = self.events.send(ConversationEvent::ProcessingChanged(false));
    }
}
