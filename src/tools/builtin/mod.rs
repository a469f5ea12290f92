//! Built-in tools for echoing and file operations.

pub mod echo;
pub mod file;

pub use echo::EchoTool;
pub use file::{ReadFileTool, WriteFileTool};
