mod command;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{env, fs, io};

use anyhow::{Context, Result};
use config::{AppConfig, ConfigStore};
use core_orchestrator::{ConversationEvent, InputMode, Orchestrator, RejectReason, SendOutcome};
use core_types::{
    MessageContent, ProviderError, ProviderId, RecognitionEvent, Role, SpeechInput,
    SpeechOutput, StructuredResponse,
};
use providers::ProviderRegistry;
use secrets::{SecretStore, mask};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::command::{Command, HELP};

const PASSPHRASE_ENV: &str = "ALMANAC_PASSPHRASE";

/// Speech output for a terminal: the answer is printed as spoken text.
#[derive(Default)]
struct ConsoleSpeech {
    speaking: AtomicBool,
}

impl SpeechOutput for ConsoleSpeech {
    fn speak(&self, text: &str) {
        self.speaking.store(true, Ordering::Release);
        println!("(spoken) {text}");
        self.speaking.store(false, Ordering::Release);
    }

    fn cancel(&self) {
        self.speaking.store(false, Ordering::Release);
    }

    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Acquire)
    }
}

/// Stands in for a recognizer: typed lines are fed back as transcripts.
struct ConsoleMic;

impl SpeechInput for ConsoleMic {
    fn start_listening(&self) -> Result<()> {
        println!("listening... type what you would say");
        Ok(())
    }

    fn stop_listening(&self) {}
}

struct App {
    store: ConfigStore,
    config: AppConfig,
    secrets: SecretStore,
    registry: Arc<ProviderRegistry>,
    orchestrator: Arc<Orchestrator>,
}

impl App {
    async fn activate(&self) {
        let id = self.config.active_provider;
        let resolved = match self.config.resolve(id, &self.secrets) {
            Ok(resolved) => resolved,
            Err(err) => {
                error!("failed to resolve provider config: {err:#}");
                println!("! could not load settings for {id}: {err:#}");
                return;
            }
        };
        match self.orchestrator.configure(resolved).await {
            Ok(()) => println!("using {} ({})", id.display_name(), self.model_label()),
            Err(err) => println!("! {}", err.user_message()),
        }
    }

    fn model_label(&self) -> String {
        self.config
            .provider(self.config.active_provider)
            .map(|settings| settings.model.clone())
            .unwrap_or_default()
    }

    fn save(&self) {
        if let Err(err) = self.store.save(&self.config) {
            error!("failed to save config: {err:#}");
            println!("! settings not saved: {err:#}");
        }
    }

    /// Returns false when the REPL should stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Send(text) => self.send(text).await,
            Command::Provider(id) => {
                self.config.active_provider = id;
                self.save();
                self.activate().await;
            }
            Command::Key { provider, key } => self.store_key(provider, &key).await,
            Command::Model(model) => {
                let active = self.config.active_provider;
                self.config.provider_mut(active).model = model;
                self.save();
                self.activate().await;
            }
            Command::Attach(path) => {
                let path = expand_home(path);
                if let Some(previous) = self.orchestrator.attach(path.clone()) {
                    println!("replaced {}", previous.display());
                }
                println!("attached {}", path.display());
            }
            Command::Detach => match self.orchestrator.detach() {
                Some(path) => println!("detached {}", path.display()),
                None => println!("nothing attached"),
            },
            Command::Voice => {
                if let Err(err) = self.orchestrator.start_listening() {
                    println!("! microphone unavailable: {err:#}");
                }
            }
            Command::Text => {
                self.orchestrator.set_input_mode(InputMode::Text);
                println!("text mode");
            }
            Command::History => print_history(&self.orchestrator),
            Command::Help => println!("{HELP}"),
            Command::Quit => return false,
        }
        true
    }

    async fn send(&self, text: String) {
        let outcome = if self.orchestrator.input_mode() == InputMode::Voice {
            if !self.orchestrator.is_listening() {
                if let Err(err) = self.orchestrator.start_listening() {
                    println!("! microphone unavailable: {err:#}");
                    return;
                }
            }
            self.orchestrator
                .on_recognition(RecognitionEvent::Final(text))
                .await;
            match self.orchestrator.on_recognition(RecognitionEvent::Ended).await {
                Some(outcome) => outcome,
                None => {
                    println!("(heard nothing)");
                    return;
                }
            }
        } else {
            self.orchestrator.submit(&text).await
        };

        match outcome {
            SendOutcome::Answered(response) => print_answer(&response),
            SendOutcome::Failed(err) => {
                if let Some(notice) = failure_notice(self.orchestrator.input_mode(), &err) {
                    println!("{notice}");
                }
            }
            SendOutcome::Rejected(RejectReason::Busy) => println!("! still working on the last message"),
            SendOutcome::Rejected(RejectReason::Empty) => println!("! nothing to send"),
        }
    }

    async fn store_key(&mut self, provider: ProviderId, key: &str) {
        let Some(secret) = self
            .config
            .provider(provider)
            .and_then(|settings| settings.api_key_ref.clone())
        else {
            println!("{} does not use an API key", provider.display_name());
            return;
        };
        if let Err(err) = self.secrets.put(&secret, key) {
            error!(%secret, "failed to store credential: {err:#}");
            println!("! key not stored: {err:#}");
            return;
        }
        if key.trim().is_empty() {
            println!("removed key for {provider}");
        } else {
            println!("stored key for {provider}: {}", mask(key));
        }
        if provider == self.config.active_provider {
            self.activate().await;
        }
    }
}

/// In voice mode the failure has already been spoken.
fn failure_notice(mode: InputMode, err: &ProviderError) -> Option<String> {
    (mode == InputMode::Text).then(|| format!("! {}", err.user_message()))
}

fn print_answer(response: &StructuredResponse) {
    println!("\n{}", response.text);
    if !response.sources.is_empty() {
        println!("  sources: {}", response.sources.join(", "));
    }
    println!("  confidence: {}%", response.confidence_score);
    for recommendation in &response.recommendations {
        println!("  - {} ({}%)", recommendation.label, recommendation.score);
    }
    println!();
}

fn print_history(orchestrator: &Orchestrator) {
    let messages = orchestrator.messages();
    if messages.is_empty() {
        println!("(no messages yet)");
    }
    for message in messages {
        let who = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        let time = message.created_at.format("%H:%M:%S");
        match &message.content {
            MessageContent::Text(text) => println!("[{time}] {who}: {text}"),
            MessageContent::Structured(response) => println!(
                "[{time}] {who}: {} ({}%)",
                response.text, response.confidence_score
            ),
        }
    }
}

fn expand_home(path: PathBuf) -> PathBuf {
    match (path.strip_prefix("~"), env::var_os("HOME")) {
        (Ok(rest), Some(home)) => Path::new(&home).join(rest),
        _ => path,
    }
}

fn spawn_progress_renderer(registry: &ProviderRegistry) {
    let mut progress = registry.subscribe_progress();
    tokio::spawn(async move {
        loop {
            match progress.recv().await {
                Ok(event) => {
                    print!("\r[engine] {:<48} {:>3}%", event.stage, event.percent());
                    if event.terminal {
                        println!();
                    }
                    io::stdout().flush().ok();
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "progress renderer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_event_printer(orchestrator: &Orchestrator) {
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConversationEvent::Retrying { attempt, delay }) => println!(
                    "... provider busy, retrying (attempt {attempt}) in {}s",
                    delay.as_secs()
                ),
                Ok(ConversationEvent::Transcript(text)) => println!("(heard) {text}"),
                Ok(ConversationEvent::ProcessingChanged(true)) => println!("thinking..."),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn init_local_logger(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir `{}`: {err}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "almanac.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,app_cli=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(writer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let data_dir = config::default_data_dir().unwrap_or_else(|_| PathBuf::from(".almanac"));
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to prepare data dir {}", data_dir.display()))?;
    let _log_guard = init_local_logger(&data_dir.join("logs"));

    let store = ConfigStore::from_dir(data_dir.join("config"));
    let config = match store.load_or_init() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err:#}");
            AppConfig::default()
        }
    };

    let passphrase = if config.security.local_encryption_enabled {
        let passphrase = env::var(PASSPHRASE_ENV).ok();
        if passphrase.is_none() {
            warn!("local encryption is enabled but {PASSPHRASE_ENV} is not set");
        }
        passphrase
    } else {
        None
    };
    let secrets = SecretStore::open(data_dir.join("secrets")).with_passphrase(passphrase);

    let registry = Arc::new(ProviderRegistry::new());
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        Arc::new(ConsoleSpeech::default()),
        Arc::new(ConsoleMic),
    ));
    spawn_progress_renderer(&registry);
    spawn_event_printer(&orchestrator);
    info!(config = %store.path().display(), "almanac started");

    let mut app = App {
        store,
        config,
        secrets,
        registry,
        orchestrator,
    };
    println!("almanac: ask anything, /help for commands");
    app.activate().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        io::stdout().flush().ok();
        let Some(line) = lines.next_line().await.context("failed to read stdin")? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match command::parse(&line) {
            Ok(command) => {
                if !app.handle(command).await {
                    break;
                }
            }
            Err(message) => println!("! {message}"),
        }
    }

    app.registry.shutdown().await;
    info!("almanac stopped");
    Ok(())
}
