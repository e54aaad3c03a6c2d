//! Per-run failover state machine.
//!
//! [`Run`] owns the cursor, the success flag and the active phase for one
//! test run. It never performs I/O: every input returns a list of
//! [`Effect`]s that the orchestrator task carries out in order. Engine events
//! are matched against the active phase's generation; anything from an older
//! phase is dropped, so whichever of {timeout, completion, error} reaches the
//! run first decides the phase.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::engine::{EngineEvent, TaggedEvent};
use crate::listener::{FailureKind, TestEvent};
use crate::report::{adapt, Report};

pub const ALL_SERVERS_FAILED: &str = "All speed test servers failed.";

/// Per-phase time limit.
pub const PHASE_TIMEOUT: Duration = Duration::from_secs(20);

/// How long a stop waits for the engine before the run is cancelled anyway.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Public run vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Catalog exhausted after at least one full cycle.
    Succeeded,
    /// Catalog exhausted without a full cycle.
    Exhausted,
    /// Stopped on request.
    Cancelled,
    /// The catalog could not be loaded.
    ConfigFailed,
}

/// What happened on one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServerStatus {
    InProgress,
    Completed,
    Failed { direction: Direction, reason: String },
    TimedOut { direction: Direction },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerResult {
    pub name: String,
    pub download: Option<Report>,
    pub upload: Option<Report>,
    #[serde(flatten)]
    pub status: ServerStatus,
}

/// Phase timing shared by every run.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Applied identically to download and upload.
    pub phase_timeout: Duration,
    /// How long a stop may wait for the engine to acknowledge it.
    pub stop_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            phase_timeout: PHASE_TIMEOUT,
            stop_grace: STOP_GRACE,
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs and effects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    Engine(TaggedEvent),
    /// The active phase's deadline passed.
    Deadline,
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    ServerStarted { index: usize },
    StartDownload { url: String, generation: u64 },
    StartUpload { url: String, payload_size_bytes: u64, generation: u64 },
    ClearListeners,
    ForceStop,
    Notify(TestEvent),
    Finished(RunOutcome),
}

#[derive(Debug, Clone, Copy)]
struct ActivePhase {
    direction: Direction,
    generation: u64,
    deadline: Instant,
    stop_requested: bool,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub struct Run {
    id: Uuid,
    started_at: DateTime<Utc>,
    catalog: Arc<Catalog>,
    timing: Timing,
    cursor: usize,
    succeeded: bool,
    generation: u64,
    phase: Option<ActivePhase>,
    phases_started: usize,
    results: Vec<ServerResult>,
    outcome: Option<RunOutcome>,
}

impl Run {
    /// Begin a run at the first server. `generation_base` must exceed every
    /// generation handed out by earlier runs on the same engine.
    pub fn start(
        catalog: Arc<Catalog>,
        timing: Timing,
        generation_base: u64,
        now: Instant,
    ) -> (Self, Vec<Effect>) {
        let mut run = Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            catalog,
            timing,
            cursor: 0,
            succeeded: false,
            generation: generation_base,
            phase: None,
            phases_started: 0,
            results: Vec::new(),
            outcome: None,
        };
        info!(run_id = %run.id, servers = run.catalog.len(), "speed test run started");
        let mut effects = Vec::new();
        run.select_server(now, &mut effects);
        (run, effects)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// `(server index, direction)` of the active phase.
    pub fn active_phase(&self) -> Option<(usize, Direction)> {
        self.phase.map(|p| (self.cursor, p.direction))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.phase.map(|p| p.deadline)
    }

    pub fn phases_started(&self) -> usize {
        self.phases_started
    }

    pub fn results(&self) -> &[ServerResult] {
        &self.results
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.id,
            started_at: self.started_at,
            cursor: self.cursor,
            succeeded: self.succeeded,
            active: self.active_phase().map(|(index, direction)| ActiveServer {
                server: self
                    .catalog
                    .get(index)
                    .map(|s| s.name.clone())
                    .unwrap_or_default(),
                direction,
            }),
            phases_started: self.phases_started,
            results: self.results.clone(),
            outcome: self.outcome,
        }
    }

    /// Feed one input. Inputs arriving after the run finished are ignored.
    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.is_finished() {
            return effects;
        }
        match input {
            Input::Stop => self.on_stop(now, &mut effects),
            Input::Deadline => self.on_deadline(now, &mut effects),
            Input::Engine(tagged) => self.on_engine(tagged, now, &mut effects),
        }
        effects
    }

    fn on_stop(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        let Some(phase) = self.phase.as_mut() else {
            debug!(run_id = %self.id, "stop requested with no active phase");
            return;
        };
        if phase.stop_requested {
            return;
        }
        info!(run_id = %self.id, direction = %phase.direction, "stop requested");
        phase.stop_requested = true;
        phase.deadline = now + self.timing.stop_grace;
        effects.push(Effect::ForceStop);
    }

    fn on_deadline(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        let Some(phase) = self.phase else {
            return;
        };
        if now < phase.deadline {
            return;
        }
        if phase.stop_requested {
            warn!(run_id = %self.id, "engine did not acknowledge stop; cancelling");
            self.cancel(effects);
            return;
        }

        warn!(
            run_id = %self.id,
            server = %self.server_name(),
            direction = %phase.direction,
            timeout_secs = self.timing.phase_timeout.as_secs(),
            "phase timed out; failing over"
        );
        self.phase = None;
        if let Some(result) = self.results.last_mut() {
            result.status = ServerStatus::TimedOut {
                direction: phase.direction,
            };
        }
        effects.push(Effect::ClearListeners);
        effects.push(Effect::ForceStop);
        self.advance(now, effects);
    }

    fn on_engine(&mut self, tagged: TaggedEvent, now: Instant, effects: &mut Vec<Effect>) {
        let Some(phase) = self.phase else {
            return;
        };
        if tagged.generation != phase.generation {
            debug!(
                run_id = %self.id,
                stale = tagged.generation,
                current = phase.generation,
                "dropping event from superseded phase"
            );
            return;
        }

        match tagged.event {
            EngineEvent::Progress { percent, report } => {
                if phase.stop_requested {
                    return;
                }
                let report = adapt(&report);
                effects.push(Effect::Notify(match phase.direction {
                    Direction::Download => TestEvent::DownloadProgress { percent, report },
                    Direction::Upload => TestEvent::UploadProgress { percent, report },
                }));
            }
            EngineEvent::Completion(report) => {
                if phase.stop_requested {
                    self.cancel(effects);
                    return;
                }
                let report = adapt(&report);
                self.phase = None;
                match phase.direction {
                    Direction::Download => {
                        info!(
                            run_id = %self.id,
                            server = %self.server_name(),
                            mbps = report.mbps(),
                            "download complete"
                        );
                        if let Some(result) = self.results.last_mut() {
                            result.download = Some(report);
                        }
                        effects.push(Effect::Notify(TestEvent::DownloadComplete { report }));
                        self.begin_phase(Direction::Upload, now, effects);
                    }
                    Direction::Upload => {
                        info!(
                            run_id = %self.id,
                            server = %self.server_name(),
                            mbps = report.mbps(),
                            "upload complete; cycle finished"
                        );
                        self.succeeded = true;
                        if let Some(result) = self.results.last_mut() {
                            result.upload = Some(report);
                            result.status = ServerStatus::Completed;
                        }
                        effects.push(Effect::Notify(TestEvent::UploadComplete { report }));
                        self.advance(now, effects);
                    }
                }
            }
            EngineEvent::Error(error) => {
                if phase.stop_requested || error.indicates_stop() {
                    debug!(run_id = %self.id, %error, "transfer stopped");
                    self.cancel(effects);
                    return;
                }
                warn!(
                    run_id = %self.id,
                    server = %self.server_name(),
                    direction = %phase.direction,
                    %error,
                    "phase failed; trying next server"
                );
                self.phase = None;
                if let Some(result) = self.results.last_mut() {
                    result.status = ServerStatus::Failed {
                        direction: phase.direction,
                        reason: error.to_string(),
                    };
                }
                effects.push(Effect::ClearListeners);
                self.advance(now, effects);
            }
        }
    }

    fn advance(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        self.cursor += 1;
        self.select_server(now, effects);
    }

    fn select_server(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        if self.cursor >= self.catalog.len() {
            self.phase = None;
            let outcome = if self.succeeded {
                info!(run_id = %self.id, "all servers tested");
                RunOutcome::Succeeded
            } else {
                warn!(run_id = %self.id, "all servers failed");
                effects.push(Effect::Notify(TestEvent::Failed {
                    kind: FailureKind::Connection,
                    message: ALL_SERVERS_FAILED.to_string(),
                }));
                RunOutcome::Exhausted
            };
            self.finish(outcome, effects);
            return;
        }

        if let Some(server) = self.catalog.get(self.cursor) {
            info!(run_id = %self.id, server = %server.name, index = self.cursor, "attempting server");
            self.results.push(ServerResult {
                name: server.name.clone(),
                download: None,
                upload: None,
                status: ServerStatus::InProgress,
            });
        }
        effects.push(Effect::ServerStarted { index: self.cursor });
        self.begin_phase(Direction::Download, now, effects);
    }

    fn begin_phase(&mut self, direction: Direction, now: Instant, effects: &mut Vec<Effect>) {
        let Some(server) = self.catalog.get(self.cursor) else {
            return;
        };
        self.generation += 1;
        self.phases_started += 1;
        self.phase = Some(ActivePhase {
            direction,
            generation: self.generation,
            deadline: now + self.timing.phase_timeout,
            stop_requested: false,
        });
        effects.push(match direction {
            Direction::Download => Effect::StartDownload {
                url: server.download_url.clone(),
                generation: self.generation,
            },
            Direction::Upload => Effect::StartUpload {
                url: server.upload_url.clone(),
                payload_size_bytes: server.upload_size(),
                generation: self.generation,
            },
        });
    }

    fn cancel(&mut self, effects: &mut Vec<Effect>) {
        self.phase = None;
        if let Some(result) = self.results.last_mut() {
            result.status = ServerStatus::Cancelled;
        }
        effects.push(Effect::ClearListeners);
        effects.push(Effect::Notify(TestEvent::Cancelled));
        self.finish(RunOutcome::Cancelled, effects);
    }

    fn finish(&mut self, outcome: RunOutcome, effects: &mut Vec<Effect>) {
        info!(run_id = %self.id, ?outcome, cursor = self.cursor, "speed test run finished");
        self.outcome = Some(outcome);
        effects.push(Effect::Finished(outcome));
    }

    fn server_name(&self) -> &str {
        self.catalog
            .get(self.cursor)
            .map(|s| s.name.as_str())
            .unwrap_or("?")
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveServer {
    pub server: String,
    pub direction: Direction,
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub cursor: usize,
    pub succeeded: bool,
    pub active: Option<ActiveServer>,
    pub phases_started: usize,
    pub results: Vec<ServerResult>,
    pub outcome: Option<RunOutcome>,
}
