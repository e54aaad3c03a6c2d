//! Speed test orchestrator.
//!
//! A single background task owns the catalog, the transfer engine and the
//! state of the current [`run::Run`]. Commands from [`SpeedTestManager`],
//! engine events and the active phase's deadline all arrive through one
//! `select!` loop, so state transitions never overlap and listener callbacks
//! are always made from that task.

pub mod run;

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, CatalogSource};
use crate::engine::{EventSink, TaggedEvent, TransferEngine};
use crate::listener::{FailureKind, ObserverSlot, ResultListener, TestEvent};

pub use run::{
    Direction, RunOutcome, RunSnapshot, ServerResult, ServerStatus, Timing, PHASE_TIMEOUT,
    STOP_GRACE,
};
use run::{Effect, Input, Run};

pub const CATALOG_LOAD_FAILED: &str = "Failed to load server list.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("a speed test run is already in progress")]
    AlreadyRunning,

    #[error("speed test orchestrator is no longer running")]
    Closed,
}

/// Coarse lifecycle published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running { server: String, direction: Direction },
    Finished { outcome: RunOutcome },
}

enum Command {
    Start {
        listener: Option<Arc<dyn ResultListener>>,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    Stop,
    Snapshot {
        reply: oneshot::Sender<Option<RunSnapshot>>,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// SpeedTestManager
// ---------------------------------------------------------------------------

/// Cheap, cloneable handle to the orchestrator task.
///
/// The orchestrator outlives any particular listener: attach and detach
/// observers freely while a run continues in the background.
#[derive(Clone)]
pub struct SpeedTestManager {
    commands: mpsc::UnboundedSender<Command>,
    observer: ObserverSlot,
    status: watch::Receiver<RunStatus>,
}

impl SpeedTestManager {
    /// Spawn the orchestrator on the current tokio runtime.
    ///
    /// The catalog is not read until the first [`start_test`](Self::start_test).
    pub fn spawn(engine: Arc<dyn TransferEngine>, source: CatalogSource, timing: Timing) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RunStatus::Idle);
        let observer = ObserverSlot::new();

        let orchestrator = Orchestrator {
            engine,
            source,
            catalog: None,
            timing,
            observer: observer.clone(),
            events_tx,
            events_rx,
            commands: commands_rx,
            status: status_tx,
            run: None,
            last_generation: 0,
        };
        tokio::spawn(orchestrator.run_loop());

        Self {
            commands: commands_tx,
            observer,
            status: status_rx,
        }
    }

    pub async fn set_listener(&self, listener: Arc<dyn ResultListener>) {
        self.observer.set(listener).await;
    }

    pub async fn remove_listener(&self) {
        self.observer.clear().await;
    }

    /// Start a run reporting to `listener`.
    ///
    /// A start while a run is in progress is rejected with
    /// [`ManagerError::AlreadyRunning`]; the in-flight run is untouched and
    /// the current listener stays attached. The listener is only installed
    /// once the orchestrator has accepted the start.
    pub async fn start_test(&self, listener: Arc<dyn ResultListener>) -> Result<(), ManagerError> {
        self.request_start(Some(listener)).await
    }

    /// Start a run reporting to whichever listener is attached, if any.
    pub async fn start(&self) -> Result<(), ManagerError> {
        self.request_start(None).await
    }

    async fn request_start(
        &self,
        listener: Option<Arc<dyn ResultListener>>,
    ) -> Result<(), ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { listener, reply })?;
        rx.await.map_err(|_| ManagerError::Closed)?
    }

    /// Cancel the active phase. Does nothing when no phase is active.
    pub fn stop_test(&self) -> Result<(), ManagerError> {
        self.send(Command::Stop)
    }

    /// State of the current or most recent run.
    pub async fn snapshot(&self) -> Result<Option<RunSnapshot>, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| ManagerError::Closed)
    }

    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }

    /// Wait until the current run has finished.
    pub async fn wait_finished(&self) -> Result<RunOutcome, ManagerError> {
        let mut status = self.status.clone();
        let finished = status
            .wait_for(|s| matches!(s, RunStatus::Finished { .. }))
            .await
            .map_err(|_| ManagerError::Closed)?;
        match &*finished {
            RunStatus::Finished { outcome } => Ok(*outcome),
            _ => Err(ManagerError::Closed),
        }
    }

    /// Stop the orchestrator task, aborting any active transfer.
    pub fn shutdown(&self) -> Result<(), ManagerError> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> Result<(), ManagerError> {
        self.commands.send(command).map_err(|_| ManagerError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator task
// ---------------------------------------------------------------------------

struct Orchestrator {
    engine: Arc<dyn TransferEngine>,
    source: CatalogSource,
    catalog: Option<Arc<Catalog>>,
    timing: Timing,
    observer: ObserverSlot,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
    events_rx: mpsc::UnboundedReceiver<TaggedEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<RunStatus>,
    run: Option<Run>,
    last_generation: u64,
}

impl Orchestrator {
    async fn run_loop(mut self) {
        debug!("orchestrator started");
        loop {
            let deadline = self.run.as_ref().and_then(Run::deadline);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(tagged) = self.events_rx.recv() => {
                    self.feed(Input::Engine(tagged)).await;
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.feed(Input::Deadline).await;
                }
            }
        }

        if self.run_active() {
            warn!("orchestrator shutting down with a phase in flight");
            self.engine.clear_listeners();
            self.engine.force_stop();
        }
        debug!("orchestrator stopped");
    }

    fn run_active(&self) -> bool {
        self.run.as_ref().is_some_and(|run| !run.is_finished())
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { listener, reply } => {
                let result = self.start_run(listener).await;
                let _ = reply.send(result);
            }
            Command::Stop => self.feed(Input::Stop).await,
            Command::Snapshot { reply } => {
                let _ = reply.send(self.run.as_ref().map(Run::snapshot));
            }
            Command::Shutdown => {}
        }
    }

    async fn start_run(
        &mut self,
        listener: Option<Arc<dyn ResultListener>>,
    ) -> Result<(), ManagerError> {
        if self.run_active() {
            warn!("start requested while a run is in progress; ignoring");
            return Err(ManagerError::AlreadyRunning);
        }
        if let Some(listener) = listener {
            self.observer.set(listener).await;
        }

        let catalog = match self.catalog.clone() {
            Some(catalog) => catalog,
            None => match self.source.load() {
                Ok(catalog) => {
                    let catalog = Arc::new(catalog);
                    self.catalog = Some(catalog.clone());
                    catalog
                }
                Err(e) => {
                    error!(source = %self.source.describe(), error = %e, "error loading server catalog");
                    self.notify(
                        &TestEvent::Failed {
                            kind: FailureKind::Config,
                            message: format!("{CATALOG_LOAD_FAILED} {e}"),
                        },
                        None,
                    )
                    .await;
                    self.status.send_replace(RunStatus::Finished {
                        outcome: RunOutcome::ConfigFailed,
                    });
                    return Ok(());
                }
            },
        };

        let (run, effects) = Run::start(catalog, self.timing, self.last_generation, Instant::now());
        self.last_generation = run.generation();
        self.run = Some(run);
        self.apply(effects).await;
        Ok(())
    }

    async fn feed(&mut self, input: Input) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let effects = run.handle(input, Instant::now());
        self.last_generation = run.generation();
        self.apply(effects).await;
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ServerStarted { index } => {
                    let server = self.catalog.as_ref().and_then(|c| c.get(index)).cloned();
                    if let Some(server) = server {
                        let event = TestEvent::ServerStarted {
                            name: server.name.clone(),
                        };
                        self.notify(&event, Some(&server)).await;
                    }
                }
                Effect::StartDownload { url, generation } => {
                    debug!(%url, generation, "starting download");
                    let sink = EventSink::new(generation, self.events_tx.clone());
                    self.engine.start_download(&url, sink);
                }
                Effect::StartUpload {
                    url,
                    payload_size_bytes,
                    generation,
                } => {
                    debug!(%url, payload_size_bytes, generation, "starting upload");
                    let sink = EventSink::new(generation, self.events_tx.clone());
                    self.engine.start_upload(&url, payload_size_bytes, sink);
                }
                Effect::ClearListeners => self.engine.clear_listeners(),
                Effect::ForceStop => self.engine.force_stop(),
                Effect::Notify(event) => self.notify(&event, None).await,
                Effect::Finished(outcome) => {
                    info!(?outcome, "run finished");
                }
            }
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let Some(run) = self.run.as_ref() else {
            return;
        };
        let status = match (run.outcome(), run.active_phase()) {
            (Some(outcome), _) => RunStatus::Finished { outcome },
            (None, Some((index, direction))) => RunStatus::Running {
                server: self
                    .catalog
                    .as_ref()
                    .and_then(|c| c.get(index))
                    .map(|s| s.name.clone())
                    .unwrap_or_default(),
                direction,
            },
            (None, None) => return,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    async fn notify(&self, event: &TestEvent, server: Option<&crate::catalog::Server>) {
        match self.observer.current().await {
            Some(listener) => event.dispatch(listener.as_ref(), server),
            None => debug!(?event, "no listener attached; dropping notification"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::{Outcome, ScriptedEngine};
    use crate::listener::RecordingListener;

    const TWO_SERVERS: &str = r#"[
        {"name": "A", "downloadUrl": "http://a/down", "uploadUrl": "http://a/up"},
        {"name": "B", "downloadUrl": "http://b/down", "uploadUrl": "http://b/up"}
    ]"#;

    #[tokio::test]
    async fn test_config_error_is_reported_and_retried() {
        let engine = Arc::new(ScriptedEngine::new());
        let manager = SpeedTestManager::spawn(
            engine.clone(),
            CatalogSource::Inline("{ broken".to_string()),
            Timing::default(),
        );
        let recorder = Arc::new(RecordingListener::new());

        manager.start_test(recorder.clone()).await.unwrap();
        assert_eq!(manager.wait_finished().await, Ok(RunOutcome::ConfigFailed));
        manager.start_test(recorder.clone()).await.unwrap();

        let failures: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, TestEvent::Failed { kind: FailureKind::Config, .. }))
            .collect();
        assert_eq!(failures.len(), 2);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let engine = Arc::new(ScriptedEngine::new());
        let manager = SpeedTestManager::spawn(
            engine.clone(),
            CatalogSource::Inline(TWO_SERVERS.to_string()),
            Timing::default(),
        );
        let recorder = Arc::new(RecordingListener::new());
        manager.set_listener(recorder.clone()).await;

        manager.stop_test().unwrap();
        manager.stop_test().unwrap();
        assert!(manager.snapshot().await.unwrap().is_none());
        assert!(recorder.events().is_empty());
        assert_eq!(engine.force_stops(), 0);
    }

    #[tokio::test]
    async fn test_restart_reuses_cached_catalog() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.script("http://a/down", Outcome::complete(1e6));
        engine.script("http://a/up", Outcome::complete(1e6));
        engine.script("http://b/down", Outcome::fail("refused"));
        let manager = SpeedTestManager::spawn(
            engine.clone(),
            CatalogSource::Inline(TWO_SERVERS.to_string()),
            Timing::default(),
        );
        let recorder = Arc::new(RecordingListener::new());

        manager.start_test(recorder.clone()).await.unwrap();
        assert_eq!(manager.wait_finished().await, Ok(RunOutcome::Succeeded));
        manager.start_test(recorder.clone()).await.unwrap();
        assert_eq!(manager.wait_finished().await, Ok(RunOutcome::Succeeded));

        let snapshot = manager.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.cursor, 2);
        assert!(snapshot.succeeded);
        assert_eq!(snapshot.results.len(), 2);
    }
}
