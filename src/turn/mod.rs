//! Turn engine: one streaming exchange with the model.
//!
//! - `state`: `TurnStatus` state machine
//! - `events`: events emitted to observers
//! - `manager`: `TurnManager`, which owns the transcript and drives the stream

pub mod events;
pub mod manager;
pub mod state;

pub use events::TurnEvent;
pub use manager::{TurnCanceller, TurnManager, TurnOutcome};
pub use state::TurnStatus;
