//! Adaptive in-memory hash map engine.
//!
//! A single [`adaptive::AdaptiveMap`] owns exactly one of two backend table
//! implementations ([`table::chained::ChainedTable`],
//! [`table::robinhood::RobinHoodTable`]) and transparently migrates between
//! them as live health signals cross configured thresholds. Around that core
//! sit a workload [`replay`] engine, a versioned [`snapshot`] codec, and a
//! single-pass workload [`dna`] analyzer.

pub mod adaptive;
pub mod config;
pub mod dna;
pub mod error;
pub mod hash;
pub mod replay;
pub mod reservoir;
pub mod snapshot;
pub mod table;
pub mod telemetry;

pub use adaptive::{AdaptiveMap, Backend, BackendKind, Hooks};
pub use config::{Policy, ReplayLimits, StartBackend};
pub use error::{EngineError, Result};
pub use replay::{Op, ReplayClock, ReplayEngine, ReplayEngineConfig, RunSummary, SamplingConfig};
pub use snapshot::{SnapshotCodec, SnapshotPayload, VerifyReport};
pub use table::{HealthSignals, Table};
