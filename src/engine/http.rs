//! HTTP transfer engine.
//!
//! Downloads stream a GET response body and count bytes as they arrive.
//! Uploads POST a streamed body of random bytes, counting bytes as they are
//! handed to the connection. Rates are plain bytes·8 / elapsed.

use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use rand::RngCore;
use reqwest::Client;
use tracing::{debug, info};

use super::{
    EngineError, EngineErrorCode, EngineEvent, EngineReport, EventSink, SinkSlot, TransferEngine,
};

/// Upload bodies are produced in slices of this size.
const CHUNK_SIZE: usize = 1_000_000;

/// Tunables for [`HttpTransferEngine`].
#[derive(Debug, Clone)]
pub struct HttpEngineOptions {
    pub connect_timeout: Duration,
    /// Minimum spacing between progress events.
    pub progress_interval: Duration,
    pub user_agent: String,
}

impl Default for HttpEngineOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            progress_interval: Duration::from_millis(100),
            user_agent: concat!("speedcheck/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

pub struct HttpTransferEngine {
    client: Client,
    progress_interval: Duration,
    slot: SinkSlot,
}

impl HttpTransferEngine {
    pub fn new(options: &HttpEngineOptions) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .user_agent(options.user_agent.clone())
            .build()
            .map_err(|e| EngineError::new(EngineErrorCode::Invalid, e.to_string()))?;
        Ok(Self {
            client,
            progress_interval: options.progress_interval,
            slot: SinkSlot::new(),
        })
    }

    fn spawn<F>(&self, sink: EventSink, transfer: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let generation = sink.generation();
        let token = self.slot.attach(sink);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(generation, "transfer cancelled");
                }
                _ = transfer => {}
            }
        });
    }
}

impl TransferEngine for HttpTransferEngine {
    fn start_download(&self, url: &str, sink: EventSink) {
        let transfer = download(
            self.client.clone(),
            url.to_string(),
            self.progress_interval,
            sink.generation(),
            self.slot.clone(),
        );
        self.spawn(sink, transfer);
    }

    fn start_upload(&self, url: &str, payload_size_bytes: u64, sink: EventSink) {
        let transfer = upload(
            self.client.clone(),
            url.to_string(),
            payload_size_bytes,
            self.progress_interval,
            sink.generation(),
            self.slot.clone(),
        );
        self.spawn(sink, transfer);
    }

    fn clear_listeners(&self) {
        self.slot.detach();
    }

    fn force_stop(&self) {
        if let Some(sink) = self.slot.stop() {
            sink.fail(EngineError::force_stop());
        }
    }
}

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

async fn download(
    client: Client,
    url: String,
    progress_interval: Duration,
    generation: u64,
    slot: SinkSlot,
) {
    let fail = |error: EngineError| {
        slot.emit(generation, EngineEvent::Error(error));
    };

    let start = Instant::now();
    let response = match client.get(&url).send().await {
        Ok(response) => response,
        Err(e) => return fail(classify(&e)),
    };
    if !response.status().is_success() {
        return fail(EngineError::new(
            EngineErrorCode::HttpStatus,
            format!("GET {} returned {}", url, response.status()),
        ));
    }

    let total = response.content_length();
    let mut stream = response.bytes_stream();
    let mut received: u64 = 0;
    let mut last_tick = Instant::now();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => received += chunk.len() as u64,
            Err(e) => return fail(classify(&e)),
        }
        if last_tick.elapsed() >= progress_interval {
            let report = EngineReport::from_transfer(received, total, start.elapsed());
            let percent = report.percent();
            slot.emit(generation, EngineEvent::Progress { percent, report });
            last_tick = Instant::now();
        }
    }

    let report = EngineReport::from_transfer(received, total.or(Some(received)), start.elapsed());
    info!(%url, bytes = received, mbps = report.transfer_rate_bit / 1_000_000.0, "download finished");
    slot.emit(generation, EngineEvent::Completion(report));
}

async fn upload(
    client: Client,
    url: String,
    payload_size_bytes: u64,
    progress_interval: Duration,
    generation: u64,
    slot: SinkSlot,
) {
    let start = Instant::now();
    let chunk = random_chunk();

    let progress_slot = slot.clone();
    let body = futures::stream::unfold(
        (0u64, Instant::now()),
        move |(sent, last_tick)| {
            let chunk = chunk.clone();
            let slot = progress_slot.clone();
            async move {
                if sent >= payload_size_bytes {
                    return None;
                }
                let len = (payload_size_bytes - sent).min(CHUNK_SIZE as u64) as usize;
                let sent = sent + len as u64;
                let mut last_tick = last_tick;
                if last_tick.elapsed() >= progress_interval {
                    let report =
                        EngineReport::from_transfer(sent, Some(payload_size_bytes), start.elapsed());
                    let percent = report.percent();
                    slot.emit(generation, EngineEvent::Progress { percent, report });
                    last_tick = Instant::now();
                }
                Some((Ok::<Bytes, std::io::Error>(chunk.slice(0..len)), (sent, last_tick)))
            }
        },
    );

    let result = client
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .header(reqwest::header::CONTENT_LENGTH, payload_size_bytes)
        .body(reqwest::Body::wrap_stream(body))
        .send()
        .await;

    let event = match result {
        Ok(response) if response.status().is_success() => {
            let report = EngineReport::from_transfer(
                payload_size_bytes,
                Some(payload_size_bytes),
                start.elapsed(),
            );
            info!(%url, bytes = payload_size_bytes, mbps = report.transfer_rate_bit / 1_000_000.0, "upload finished");
            EngineEvent::Completion(report)
        }
        Ok(response) => EngineEvent::Error(EngineError::new(
            EngineErrorCode::HttpStatus,
            format!("POST {} returned {}", url, response.status()),
        )),
        Err(e) => EngineEvent::Error(classify(&e)),
    };
    slot.emit(generation, event);
}

fn random_chunk() -> Bytes {
    let mut data = vec![0u8; CHUNK_SIZE];
    rand::thread_rng().fill_bytes(&mut data);
    Bytes::from(data)
}

fn classify(error: &reqwest::Error) -> EngineError {
    let code = if error.is_connect() {
        EngineErrorCode::Connection
    } else if error.is_builder() {
        EngineErrorCode::Invalid
    } else if error.is_status() {
        EngineErrorCode::HttpStatus
    } else {
        EngineErrorCode::Io
    };
    EngineError::new(code, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn serve_once(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}/file", addr)
    }

    #[tokio::test]
    async fn test_download_reports_completion() {
        let url = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello").await;
        let engine = HttpTransferEngine::new(&HttpEngineOptions::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.start_download(&url, EventSink::new(1, tx));

        loop {
            let tagged = rx.recv().await.unwrap();
            match tagged.event {
                EngineEvent::Progress { .. } => continue,
                EngineEvent::Completion(report) => {
                    assert_eq!(report.bytes_transferred, 5);
                    assert_eq!(report.total_bytes, Some(5));
                    break;
                }
                EngineEvent::Error(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn test_download_http_error_status() {
        let url = serve_once(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let engine = HttpTransferEngine::new(&HttpEngineOptions::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.start_download(&url, EventSink::new(1, tx));

        let tagged = rx.recv().await.unwrap();
        match tagged.event {
            EngineEvent::Error(e) => {
                assert_eq!(e.code, EngineErrorCode::HttpStatus);
                assert!(!e.indicates_stop());
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_force_stop_reports_stop() {
        // Accepts the connection but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let engine = HttpTransferEngine::new(&HttpEngineOptions::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.start_download(&format!("http://{}/slow", addr), EventSink::new(9, tx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.force_stop();

        let tagged = rx.recv().await.unwrap();
        assert_eq!(tagged.generation, 9);
        assert!(matches!(tagged.event, EngineEvent::Error(ref e) if e.indicates_stop()));
    }
}
