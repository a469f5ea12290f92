//! Tool registry for managing available tools.
//!
//! The registry is an ordinary value owned by whoever builds the engine;
//! there is no process-wide instance.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::llm::ToolDefinition;
use crate::tools::builtin::{EchoTool, ReadFileTool, WriteFileTool};
use crate::tools::tool::Tool;

/// Registry of available tools, keyed (and ordered) by name.
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Arc<dyn Tool>>>,
    /// Names installed by [`ToolRegistry::with_builtins`]; never shadowed.
    builtin_names: HashSet<String>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(BTreeMap::new()),
            builtin_names: HashSet::new(),
        }
    }

    /// Registry with the built-in tools, file tools sandboxed to `base_dir` when given.
    pub fn with_builtins(base_dir: Option<PathBuf>) -> Self {
        let (read, write) = match base_dir {
            Some(dir) => (
                ReadFileTool::new().with_base_dir(dir.clone()),
                WriteFileTool::new().with_base_dir(dir),
            ),
            None => (ReadFileTool::new(), WriteFileTool::new()),
        };

        let mut registry = Self::new();
        registry.install_builtin(Arc::new(EchoTool));
        registry.install_builtin(Arc::new(read));
        registry.install_builtin(Arc::new(write));
        registry
    }

    fn install_builtin(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.builtin_names.insert(name.clone());
        self.tools.get_mut().insert(name.clone(), tool);
        tracing::debug!(tool = %name, "Installed built-in tool");
    }

    /// Register a tool, replacing any earlier one of the same name.
    ///
    /// Returns `false` (and registers nothing) if the name belongs to a built-in.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.name().to_string();
        if self.builtin_names.contains(&name) {
            tracing::warn!(tool = %name, "Rejected tool registration: would shadow a built-in tool");
            return false;
        }
        self.tools.write().await.insert(name.clone(), tool);
        tracing::debug!(tool = %name, "Registered tool");
        true
    }

    /// Remove a dynamically registered tool. Built-ins stay.
    pub async fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if self.builtin_names.contains(name) {
            return None;
        }
        self.tools.write().await.remove(name)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Tool names in sorted order.
    pub async fn list(&self) -> Vec<String> {
        self.tools.read().await.keys().cloned().collect()
    }

    /// Definitions advertised to the model, sorted by name.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .await
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
