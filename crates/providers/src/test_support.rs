use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use core_types::{ProviderConfig, ProviderError, ProviderId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::{LocalChatRequest, LocalEngine, LocalRuntime, ProgressSink};

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub path: String,
    pub authorization: Option<String>,
    pub api_key: Option<String>,
    pub body: Value,
}

pub(crate) struct StubServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl StubServer {
    pub async fn start(replies: Vec<(u16, String)>) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind stub server");
        let port = listener.local_addr().expect("stub addr").port();
        let queue = Arc::new(Mutex::new(VecDeque::from(replies)));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let request = read_request(&mut socket).await;
                recorded.lock().push(request);
                let (status, body) = queue
                    .lock()
                    .pop_front()
                    .unwrap_or_else(|| (500, r#"{"error":"no stubbed reply"}"#.to_string()));
                let response = format!(
                    "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            requests,
            task,
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_request(socket: &mut TcpStream) -> RecordedRequest {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 4096];
    let header_end = loop {
        let read = socket.read(&mut chunk).await.unwrap_or(0);
        if read == 0 {
            break buffer.len();
        }
        buffer.extend_from_slice(&chunk[..read]);
        if let Some(pos) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let header = |wanted: &str| {
        head.lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case(wanted)
                .then(|| value.trim().to_string())
        })
    };
    let content_length = header("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    while buffer.len() < header_end + content_length {
        let read = socket.read(&mut chunk).await.unwrap_or(0);
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
    }

    let end = (header_end + content_length).min(buffer.len());
    RecordedRequest {
        path: head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or_default()
            .to_string(),
        authorization: header("authorization"),
        api_key: header("x-goog-api-key"),
        body: serde_json::from_slice(&buffer[header_end..end]).unwrap_or(Value::Null),
    }
}

pub(crate) fn provider_config(id: ProviderId, base_url: &str, model: &str) -> ProviderConfig {
    ProviderConfig {
        id,
        base_url: base_url.to_string(),
        api_key: id.requires_credential().then(|| "test-key".to_string()),
        model: model.to_string(),
        vision_model: None,
        temperature: 0.5,
        max_tokens: 1024,
    }
}

pub(crate) const STRUCTURED_ANSWER: &str = r#"{"text":"Paris is the capital of France.","sources":["General Knowledge"],"confidence_score":97,"analysis":{"intent":"Information Retrieval","context":"Geography"},"recommendations":[{"label":"Eiffel Tower","score":88}]}"#;

pub(crate) struct FakeRuntime {
    pub engine: Arc<FakeEngine>,
    loads: AtomicUsize,
    failures: usize,
    load_time: Duration,
}

impl FakeRuntime {
    pub fn new(reply: &str) -> Self {
        Self::failing(reply, 0)
    }

    pub fn failing(reply: &str, failures: usize) -> Self {
        Self {
            engine: Arc::new(FakeEngine {
                reply: reply.to_string(),
                requests: Mutex::new(Vec::new()),
                unloads: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
            loads: AtomicUsize::new(0),
            failures,
            load_time: Duration::ZERO,
        }
    }

    pub fn slow(reply: &str, load_time: Duration) -> Self {
        Self {
            load_time,
            ..Self::failing(reply, 0)
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalRuntime for FakeRuntime {
    async fn load(
        &self,
        model: &str,
        progress: ProgressSink,
    ) -> Result<Arc<dyn LocalEngine>, ProviderError> {
        let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
        progress.report(format!("Fetching {model}"), 0.5);
        if self.load_time.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.load_time).await;
        }
        if attempt < self.failures {
            return Err(ProviderError::EngineLoad("out of memory".to_string()));
        }
        Ok(self.engine.clone())
    }
}

pub(crate) struct FakeEngine {
    reply: String,
    pub requests: Mutex<Vec<LocalChatRequest>>,
    pub unloads: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

#[async_trait]
impl LocalEngine for FakeEngine {
    async fn chat(
        &self,
        request: LocalChatRequest,
    ) -> Result<String, ProviderError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        self.requests.lock().push(request);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }

    async fn unload(&self) -> Result<(), ProviderError> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
