//! Transfer engine boundary.
//!
//! A [`TransferEngine`] performs exactly one download or upload at a time
//! against a URL and reports back through an [`EventSink`]. The orchestrator
//! reuses one engine instance for every phase of every run; each phase hands
//! the engine a fresh sink, which replaces (never stacks on) the previous one.

pub mod http;
pub mod scripted;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Engine report
// ---------------------------------------------------------------------------

/// Native measurement shape produced by an engine while a transfer runs.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineReport {
    /// Measured transfer rate in bits per second.
    pub transfer_rate_bit: f64,
    /// Bytes moved so far.
    pub bytes_transferred: u64,
    /// Expected total, when the engine knows it.
    pub total_bytes: Option<u64>,
    /// Wall-clock time since the transfer started.
    pub elapsed: Duration,
}

impl EngineReport {
    /// Build a report from a byte count and elapsed time.
    pub fn from_transfer(bytes_transferred: u64, total_bytes: Option<u64>, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let transfer_rate_bit = if secs > 0.0 {
            (bytes_transferred as f64 * 8.0) / secs
        } else {
            0.0
        };
        Self {
            transfer_rate_bit,
            bytes_transferred,
            total_bytes,
            elapsed,
        }
    }

    /// Completion percentage in `0.0..=100.0`, or 0 when the total is unknown.
    pub fn percent(&self) -> f32 {
        match self.total_bytes {
            Some(total) if total > 0 => {
                ((self.bytes_transferred as f64 / total as f64) * 100.0).min(100.0) as f32
            }
            _ => 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

/// Coarse classification of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorCode {
    /// The transfer was torn down by [`TransferEngine::force_stop`].
    ForceStop,
    /// Could not connect to the server.
    Connection,
    /// The server answered with a non-success HTTP status.
    HttpStatus,
    /// Any other I/O failure mid-transfer.
    Io,
    /// The engine could not start the transfer (bad URL, client build error).
    Invalid,
}

impl fmt::Display for EngineErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineErrorCode::ForceStop => write!(f, "force_stop"),
            EngineErrorCode::Connection => write!(f, "connection"),
            EngineErrorCode::HttpStatus => write!(f, "http_status"),
            EngineErrorCode::Io => write!(f, "io"),
            EngineErrorCode::Invalid => write!(f, "invalid"),
        }
    }
}

/// Error reported by an engine for the in-flight transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: EngineErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: EngineErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The error a forced stop produces.
    pub fn force_stop() -> Self {
        Self::new(EngineErrorCode::ForceStop, "force_stop")
    }

    /// True when the failure is the echo of an explicit stop rather than a
    /// network problem.
    ///
    /// Engines that only report free-form text are matched on the message.
    pub fn indicates_stop(&self) -> bool {
        if self.code == EngineErrorCode::ForceStop {
            return true;
        }
        let msg = self.message.to_lowercase();
        msg.contains("socket closed") || msg.contains("force_stop")
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Everything an engine can say about a transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Progress { percent: f32, report: EngineReport },
    Completion(EngineReport),
    Error(EngineError),
}

/// An engine event stamped with the phase generation it belongs to.
#[derive(Debug, Clone)]
pub struct TaggedEvent {
    pub generation: u64,
    pub event: EngineEvent,
}

/// Per-phase listener handed to the engine.
///
/// Every event emitted through a sink carries the generation of the phase it
/// was created for, so the orchestrator can drop events from a superseded
/// phase.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event. Returns false once the orchestrator has gone away.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn fail(&self, error: EngineError) -> bool {
        self.emit(EngineEvent::Error(error))
    }
}

// ---------------------------------------------------------------------------
// SinkSlot
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SlotState {
    sink: Option<EventSink>,
    cancel: Option<CancellationToken>,
}

/// The engine-side half of the listener contract: at most one attached sink
/// plus the cancellation token of the transfer that sink belongs to.
#[derive(Clone, Default)]
pub struct SinkSlot {
    inner: Arc<Mutex<SlotState>>,
}

impl SinkSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach the sink for a new transfer, cancelling whatever ran before.
    /// Returns the token the new transfer must watch.
    pub fn attach(&self, sink: EventSink) -> CancellationToken {
        let token = CancellationToken::new();
        let mut state = self.state();
        if let Some(previous) = state.cancel.replace(token.clone()) {
            previous.cancel();
        }
        state.sink = Some(sink);
        token
    }

    pub fn detach(&self) {
        self.state().sink = None;
    }

    /// Cancel the running transfer and hand back the sink still attached to
    /// it, if any, so the caller can report the stop.
    pub fn stop(&self) -> Option<EventSink> {
        let mut state = self.state();
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
        state.sink.clone()
    }

    /// Emit on behalf of the transfer started for `generation`. Dropped when
    /// the sink was detached or replaced since.
    pub fn emit(&self, generation: u64, event: EngineEvent) -> bool {
        let sink = self
            .state()
            .sink
            .as_ref()
            .filter(|s| s.generation() == generation)
            .cloned();
        match sink {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// TransferEngine
// ---------------------------------------------------------------------------

/// One-transfer-at-a-time download/upload capability.
///
/// `start_*` must return promptly; the transfer runs on the engine's own
/// tasks and reports through the sink. Starting a transfer replaces the
/// current sink.
pub trait TransferEngine: Send + Sync {
    fn start_download(&self, url: &str, sink: EventSink);

    fn start_upload(&self, url: &str, payload_size_bytes: u64, sink: EventSink);

    /// Detach the current sink; nothing further is reported for the
    /// in-flight transfer.
    fn clear_listeners(&self);

    /// Abort the in-flight transfer. If a sink is still attached the engine
    /// reports an error for which [`EngineError::indicates_stop`] is true.
    fn force_stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_from_transfer() {
        let report = EngineReport::from_transfer(1_250_000, Some(2_500_000), Duration::from_secs(1));
        assert_eq!(report.transfer_rate_bit, 10_000_000.0);
        assert_eq!(report.percent(), 50.0);
    }

    #[test]
    fn test_zero_elapsed_is_zero_rate() {
        let report = EngineReport::from_transfer(1000, None, Duration::ZERO);
        assert_eq!(report.transfer_rate_bit, 0.0);
        assert_eq!(report.percent(), 0.0);
    }

    #[test]
    fn test_stop_detection() {
        assert!(EngineError::force_stop().indicates_stop());
        assert!(EngineError::new(EngineErrorCode::Io, "Socket closed by peer").indicates_stop());
        assert!(!EngineError::new(EngineErrorCode::Connection, "connection refused").indicates_stop());
    }

    #[tokio::test]
    async fn test_slot_drops_events_for_replaced_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot = SinkSlot::new();
        let first = slot.attach(EventSink::new(1, tx.clone()));
        slot.attach(EventSink::new(2, tx));
        assert!(first.is_cancelled());

        assert!(!slot.emit(1, EngineEvent::Error(EngineError::force_stop())));
        assert!(slot.emit(2, EngineEvent::Error(EngineError::force_stop())));
        assert_eq!(rx.recv().await.unwrap().generation, 2);

        slot.detach();
        assert!(!slot.emit(2, EngineEvent::Error(EngineError::force_stop())));
        assert!(slot.stop().is_none());
    }

    #[tokio::test]
    async fn test_sink_stamps_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(7, tx);
        assert!(sink.fail(EngineError::force_stop()));
        let tagged = rx.recv().await.unwrap();
        assert_eq!(tagged.generation, 7);
        assert!(matches!(tagged.event, EngineEvent::Error(ref e) if e.indicates_stop()));
    }
}
