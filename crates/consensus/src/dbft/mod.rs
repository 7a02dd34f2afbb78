//! dBFT consensus engine.
//!
//! The engine owns the round context exclusively and processes one event at
//! a time: inbound payloads, timer expiries, transaction arrivals and
//! persisted blocks. All outbound effects are produced synchronously from
//! the handlers.

pub mod config;
pub mod engine;
pub mod state;

pub use config::DbftConfig;
pub use engine::DbftEngine;
pub use state::{ConsensusPhase, DbftEvent, DbftStats};
