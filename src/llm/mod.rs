//! Model API integration.
//!
//! The engine depends only on the [`ContentGenerator`] trait. Concrete
//! transports live outside this crate; [`ScriptedGenerator`] plays back
//! canned streams for tests and for the offline binary.

pub mod provider;
pub mod scripted;

pub use provider::*;
pub use scripted::{Script, ScriptedGenerator};
