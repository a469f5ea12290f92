//! Tools the model can call, and the dispatcher that runs them for a turn.

pub mod builtin;
pub mod dispatch;
pub mod registry;
pub mod tool;

pub use dispatch::ToolDispatcher;
pub use registry::ToolRegistry;
pub use tool::*;
