use std::collections::HashMap;
use std::sync::Arc;

use insights_core::tools::{LocalTool, ToolDefinition};

use crate::error::EngineError;

/// Local tools the assistant may call by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn LocalTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn LocalTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LocalTool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Fail on the first expected name with no registered tool.
    pub fn ensure_all(&self, expected: &[String]) -> Result<(), EngineError> {
        match expected.iter().find(|name| !self.contains(name)) {
            Some(missing) => Err(EngineError::UnknownTool(missing.clone())),
            None => Ok(()),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
