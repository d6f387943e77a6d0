//! DealPulse Backend Library
//!
//! Live-game state consensus and promotion triggering: multi-source fetch,
//! reconciliation, event-sourced monitoring, and idempotent validation.
//! Exposes core modules for use by the binary and tests.

pub mod consensus;
pub mod evidence;
pub mod models;
pub mod monitor;
pub mod resilience;
pub mod sources;
pub mod store;
pub mod validation;

pub use consensus::ConsensusEngine;
pub use monitor::{detect_game_state_changes, GameEventListener, GameMonitor, MonitorConfig};
pub use sources::{FetchOptions, FetchReport, SourceFetcher};
pub use validation::{TriggerPipeline, ValidationService, APPROVAL_CONFIDENCE_THRESHOLD};
