#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use settle_common::CheckError;
use settle_common::broker::{ConsumedMessage, MessageStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .json(),
            )
            .with(filter)
            .init();
    });
}

/// HTTP server answering each request with the next scripted response; the
/// last response repeats once the script runs out.
pub struct ScriptedServer {
    pub url: String,
    hits: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl ScriptedServer {
    pub async fn start(script: Vec<(u16, &str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let script: Vec<(u16, String)> = script
            .into_iter()
            .map(|(status, body)| (status, body.to_string()))
            .collect();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = script[n.min(script.len() - 1)].clone();

                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => request.extend_from_slice(&buf[..read]),
                    }
                }

                let response = format!(
                    "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    reason(status),
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        Self {
            url: format!("http://{addr}/health"),
            hits,
            handle,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

/// In-memory message source that records acknowledgements and the final
/// commit. Once the script is exhausted it waits forever, like an idle topic.
#[derive(Default)]
pub struct ScriptedStream {
    pending: Mutex<VecDeque<Result<Option<ConsumedMessage>, CheckError>>>,
    acked: Mutex<Vec<(i32, i64)>>,
    committed: Mutex<Vec<(i32, i64)>>,
    finished: AtomicBool,
}

impl ScriptedStream {
    pub fn new(messages: Vec<ConsumedMessage>) -> Self {
        let stream = Self::default();
        for message in messages {
            stream.push(Ok(Some(message)));
        }
        stream
    }

    pub fn push(&self, item: Result<Option<ConsumedMessage>, CheckError>) {
        self.pending.lock().expect("pending lock").push_back(item);
    }

    pub fn acked(&self) -> Vec<(i32, i64)> {
        self.acked.lock().expect("acked lock").clone()
    }

    /// Acknowledgements made durable by `finish`.
    pub fn committed(&self) -> Vec<(i32, i64)> {
        self.committed.lock().expect("committed lock").clone()
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl MessageStream for ScriptedStream {
    async fn next_message(&self) -> Result<Option<ConsumedMessage>, CheckError> {
        let next = self.pending.lock().expect("pending lock").pop_front();
        match next {
            Some(item) => item,
            None => std::future::pending().await,
        }
    }

    fn acknowledge(&self, message: &ConsumedMessage) -> Result<(), CheckError> {
        self.acked
            .lock()
            .expect("acked lock")
            .push((message.partition, message.offset));
        Ok(())
    }

    async fn finish(self: Arc<Self>) -> Result<(), CheckError> {
        let acked = self.acked();
        *self.committed.lock().expect("committed lock") = acked;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}
