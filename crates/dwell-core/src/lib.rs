//! Core domain logic for the dwell activity tracker.
//!
//! This crate contains:
//! - Signal ingestion: debouncing raw browser signals into transitions
//! - The session state machine and duration accounting
//! - The `StateStore` abstraction, recovery and the host message protocol

mod accountant;
pub mod clock;
pub mod config;
mod coordinator;
pub mod debounce;
mod engine;
pub mod machine;
pub mod protocol;
pub mod recovery;
pub mod session;
pub mod signal;
pub mod store;
mod types;

pub use accountant::{Accrual, DurationAccountant};
pub use clock::{Clock, ManualClock, SystemClock, TimezoneContext, day_key};
pub use config::{ConfigError, EngineConfig};
pub use coordinator::{Dispatch, EventCoordinator, Lane};
pub use engine::{Engine, Inbound};
pub use machine::{CompletedSession, Effect, HostSettings, OpenSession};
pub use protocol::{
    CircuitStateKind, Envelope, Message, MessageClass, MessageType, ProtocolError, StatusReport,
    WireEnvelope,
};
pub use recovery::RecoveryReport;
pub use session::{ActivitySession, Corruption, PausedInterval, SessionStatus};
pub use signal::{RawSignal, SignalError, SignalKind, Transition};
pub use store::{
    KeyTotal, MemoryStore, QuarantinedRecord, ScanResult, StateStore, StoreError, UpsertOutcome,
};
pub use types::{ActivityKey, MessageId, SessionId, ValidationError};
