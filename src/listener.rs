//! Result listener contract.
//!
//! The orchestrator reports progress and outcomes through a
//! [`ResultListener`]. All callbacks for a run are made from the
//! orchestrator's own task, one at a time, so implementations never see
//! concurrent calls. Listeners must return quickly.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use crate::catalog::Server;
use crate::report::Report;

/// Terminal failures that reach the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    /// The server catalog could not be loaded.
    Config,
    /// Every server was tried and none completed a full cycle.
    Connection,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Config => write!(f, "config_error"),
            FailureKind::Connection => write!(f, "connection_error"),
        }
    }
}

pub trait ResultListener: Send + Sync {
    fn on_download_progress(&self, percent: f32, report: Report);
    fn on_download_complete(&self, report: Report);
    fn on_upload_progress(&self, percent: f32, report: Report);
    fn on_upload_complete(&self, report: Report);
    fn on_test_failed(&self, kind: FailureKind, message: &str);
    fn on_test_cancelled(&self);

    /// A server's download phase is about to start.
    fn on_server_started(&self, _server: &Server) {}
}

// ---------------------------------------------------------------------------
// Observer slot
// ---------------------------------------------------------------------------

/// Replaceable, possibly empty, reference to the current listener.
///
/// The orchestrator reads the slot before every dispatch, so a listener can
/// be attached or detached while a run keeps going in the background.
#[derive(Clone, Default)]
pub struct ObserverSlot {
    inner: Arc<RwLock<Option<Arc<dyn ResultListener>>>>,
}

impl ObserverSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, listener: Arc<dyn ResultListener>) {
        *self.inner.write().await = Some(listener);
    }

    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }

    pub async fn current(&self) -> Option<Arc<dyn ResultListener>> {
        self.inner.read().await.clone()
    }
}

// ---------------------------------------------------------------------------
// Event form
// ---------------------------------------------------------------------------

/// One listener callback as a value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TestEvent {
    ServerStarted { name: String },
    DownloadProgress { percent: f32, report: Report },
    DownloadComplete { report: Report },
    UploadProgress { percent: f32, report: Report },
    UploadComplete { report: Report },
    Failed { kind: FailureKind, message: String },
    Cancelled,
}

impl TestEvent {
    /// Invoke the matching callback on `listener`.
    pub fn dispatch(&self, listener: &dyn ResultListener, server: Option<&Server>) {
        match self {
            TestEvent::ServerStarted { .. } => {
                if let Some(server) = server {
                    listener.on_server_started(server);
                }
            }
            TestEvent::DownloadProgress { percent, report } => {
                listener.on_download_progress(*percent, *report)
            }
            TestEvent::DownloadComplete { report } => listener.on_download_complete(*report),
            TestEvent::UploadProgress { percent, report } => {
                listener.on_upload_progress(*percent, *report)
            }
            TestEvent::UploadComplete { report } => listener.on_upload_complete(*report),
            TestEvent::Failed { kind, message } => listener.on_test_failed(*kind, message),
            TestEvent::Cancelled => listener.on_test_cancelled(),
        }
    }
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// Forwards every callback into an unbounded channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<TestEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TestEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: TestEvent) {
        // Receiver gone means nobody is watching any more.
        let _ = self.tx.send(event);
    }
}

impl ResultListener for ChannelListener {
    fn on_download_progress(&self, percent: f32, report: Report) {
        self.send(TestEvent::DownloadProgress { percent, report });
    }

    fn on_download_complete(&self, report: Report) {
        self.send(TestEvent::DownloadComplete { report });
    }

    fn on_upload_progress(&self, percent: f32, report: Report) {
        self.send(TestEvent::UploadProgress { percent, report });
    }

    fn on_upload_complete(&self, report: Report) {
        self.send(TestEvent::UploadComplete { report });
    }

    fn on_test_failed(&self, kind: FailureKind, message: &str) {
        self.send(TestEvent::Failed {
            kind,
            message: message.to_string(),
        });
    }

    fn on_test_cancelled(&self) {
        self.send(TestEvent::Cancelled);
    }

    fn on_server_started(&self, server: &Server) {
        self.send(TestEvent::ServerStarted {
            name: server.name.clone(),
        });
    }
}

/// Keeps every callback in memory, in order.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<TestEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TestEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn push(&self, event: TestEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl ResultListener for RecordingListener {
    fn on_download_progress(&self, percent: f32, report: Report) {
        self.push(TestEvent::DownloadProgress { percent, report });
    }

    fn on_download_complete(&self, report: Report) {
        self.push(TestEvent::DownloadComplete { report });
    }

    fn on_upload_progress(&self, percent: f32, report: Report) {
        self.push(TestEvent::UploadProgress { percent, report });
    }

    fn on_upload_complete(&self, report: Report) {
        self.push(TestEvent::UploadComplete { report });
    }

    fn on_test_failed(&self, kind: FailureKind, message: &str) {
        self.push(TestEvent::Failed {
            kind,
            message: message.to_string(),
        });
    }

    fn on_test_cancelled(&self) {
        self.push(TestEvent::Cancelled);
    }

    fn on_server_started(&self, server: &Server) {
        self.push(TestEvent::ServerStarted {
            name: server.name.clone(),
        });
    }
}
