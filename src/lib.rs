//! speedcheck -- Failover-aware download/upload speed testing.
//!
//! This crate runs sequential download and upload transfers against an
//! ordered catalog of servers, failing over to the next server whenever a
//! phase errors or times out, and reports progress and outcomes through a
//! replaceable listener.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod listener;
pub mod orchestrator;
pub mod report;

pub use catalog::{Catalog, CatalogError, CatalogSource, Server};
pub use engine::{EngineError, EngineErrorCode, EngineEvent, EngineReport, EventSink, TransferEngine};
pub use listener::{FailureKind, ResultListener, TestEvent};
pub use orchestrator::{ManagerError, RunOutcome, RunStatus, SpeedTestManager, Timing};
pub use report::{adapt, Report, SpeedQuality};
