//! Assist engine: streaming turn engine and workflow scheduler.

pub mod config;
pub mod error;
pub mod llm;
pub mod retry;
pub mod tools;
pub mod tracker;
pub mod turn;
pub mod workflow;
