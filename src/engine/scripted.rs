//! Deterministic in-memory transfer engine.
//!
//! Each URL is mapped to an [`Outcome`]; starting a transfer plays that
//! outcome on a tokio task (optional progress ticks, then completion, error,
//! or silence). Used by the test-suite and for offline dry runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use super::{
    EngineError, EngineErrorCode, EngineEvent, EngineReport, EventSink, SinkSlot, TransferEngine,
};

/// How a scripted transfer ends.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Complete { rate_bit: f64 },
    Fail { message: String },
    /// Never reports back.
    Hang,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub delay: Duration,
    pub progress_steps: u32,
    pub terminal: Terminal,
}

impl Outcome {
    pub fn complete(rate_bit: f64) -> Self {
        Self::new(Terminal::Complete { rate_bit })
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(Terminal::Fail {
            message: message.into(),
        })
    }

    pub fn hang() -> Self {
        Self::new(Terminal::Hang)
    }

    fn new(terminal: Terminal) -> Self {
        Self {
            delay: Duration::from_millis(100),
            progress_steps: 0,
            terminal,
        }
    }

    /// Time between the start and the terminal event.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Emit `steps` evenly spaced progress events before the terminal one.
    pub fn with_progress(mut self, steps: u32) -> Self {
        self.progress_steps = steps;
        self
    }
}

/// A transfer the engine was asked to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Download { url: String },
    Upload { url: String, payload_size_bytes: u64 },
}

impl Call {
    pub fn url(&self) -> &str {
        match self {
            Call::Download { url } | Call::Upload { url, .. } => url,
        }
    }
}

#[derive(Default)]
struct Journal {
    calls: Vec<Call>,
    force_stops: usize,
    clears: usize,
}

pub struct ScriptedEngine {
    scripts: Mutex<HashMap<String, Outcome>>,
    journal: Mutex<Journal>,
    slot: SinkSlot,
    acknowledge_stop: bool,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            journal: Mutex::new(Journal::default()),
            slot: SinkSlot::new(),
            acknowledge_stop: true,
        }
    }

    /// An engine whose `force_stop` tears the transfer down without
    /// reporting anything.
    pub fn with_silent_stop() -> Self {
        Self {
            acknowledge_stop: false,
            ..Self::new()
        }
    }

    /// Map `url` to an outcome. Unscripted URLs fail with a connection error.
    pub fn script(&self, url: impl Into<String>, outcome: Outcome) {
        lock(&self.scripts).insert(url.into(), outcome);
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.journal).calls.clone()
    }

    pub fn force_stops(&self) -> usize {
        lock(&self.journal).force_stops
    }

    pub fn clears(&self) -> usize {
        lock(&self.journal).clears
    }

    fn start(&self, call: Call, total_bytes: Option<u64>, sink: EventSink) {
        let outcome = lock(&self.scripts)
            .get(call.url())
            .cloned()
            .unwrap_or_else(|| Outcome::fail("connection refused"));
        let generation = sink.generation();
        lock(&self.journal).calls.push(call);

        let token = self.slot.attach(sink);
        let slot = self.slot.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(generation, "scripted transfer cancelled");
                }
                _ = play(outcome, total_bytes, generation, slot) => {}
            }
        });
    }
}

async fn play(outcome: Outcome, total_bytes: Option<u64>, generation: u64, slot: SinkSlot) {
    let total = total_bytes.unwrap_or(1_000_000);
    let steps = outcome.progress_steps;
    let tick = outcome.delay / (steps + 1);

    for step in 1..=steps {
        tokio::time::sleep(tick).await;
        let done = total * u64::from(step) / u64::from(steps + 1);
        if let Terminal::Complete { rate_bit } = outcome.terminal {
            let report = scripted_report(rate_bit, done, total, tick * step);
            let percent = report.percent();
            slot.emit(generation, EngineEvent::Progress { percent, report });
        }
    }
    tokio::time::sleep(outcome.delay.saturating_sub(tick * steps)).await;

    match outcome.terminal {
        Terminal::Complete { rate_bit } => {
            let report = scripted_report(rate_bit, total, total, outcome.delay);
            slot.emit(generation, EngineEvent::Completion(report));
        }
        Terminal::Fail { message } => {
            let error = EngineError::new(EngineErrorCode::Connection, message);
            slot.emit(generation, EngineEvent::Error(error));
        }
        Terminal::Hang => std::future::pending::<()>().await,
    }
}

fn scripted_report(rate_bit: f64, done: u64, total: u64, elapsed: Duration) -> EngineReport {
    EngineReport {
        transfer_rate_bit: rate_bit,
        bytes_transferred: done,
        total_bytes: Some(total),
        elapsed,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TransferEngine for ScriptedEngine {
    fn start_download(&self, url: &str, sink: EventSink) {
        self.start(
            Call::Download {
                url: url.to_string(),
            },
            None,
            sink,
        );
    }

    fn start_upload(&self, url: &str, payload_size_bytes: u64, sink: EventSink) {
        self.start(
            Call::Upload {
                url: url.to_string(),
                payload_size_bytes,
            },
            Some(payload_size_bytes),
            sink,
        );
    }

    fn clear_listeners(&self) {
        self.slot.detach();
        lock(&self.journal).clears += 1;
    }

    fn force_stop(&self) {
        lock(&self.journal).force_stops += 1;
        let sink = self.slot.stop();
        if self.acknowledge_stop {
            if let Some(sink) = sink {
                sink.fail(EngineError::force_stop());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_plays_progress_then_completion() {
        let engine = ScriptedEngine::new();
        engine.script("http://a/down", Outcome::complete(8e6).with_progress(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.start_download("http://a/down", EventSink::new(1, tx));

        let mut progress = 0;
        loop {
            let tagged = rx.recv().await.unwrap();
            match tagged.event {
                EngineEvent::Progress { .. } => progress += 1,
                EngineEvent::Completion(report) => {
                    assert_eq!(report.transfer_rate_bit, 8e6);
                    break;
                }
                EngineEvent::Error(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!(progress, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_sink_hears_nothing() {
        let engine = ScriptedEngine::new();
        engine.script("http://a/down", Outcome::complete(1.0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.start_download("http://a/down", EventSink::new(1, tx));
        engine.clear_listeners();
        engine.force_stop();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.clears(), 1);
        assert_eq!(engine.force_stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_stop_reports_stop() {
        let engine = ScriptedEngine::new();
        engine.script("http://a/up", Outcome::hang());
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.start_upload("http://a/up", 10, EventSink::new(4, tx));
        engine.force_stop();

        let tagged = rx.recv().await.unwrap();
        assert_eq!(tagged.generation, 4);
        assert!(matches!(tagged.event, EngineEvent::Error(ref e) if e.indicates_stop()));
    }
}
