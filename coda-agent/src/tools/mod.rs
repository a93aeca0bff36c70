pub mod external;
pub mod files;
pub mod process;
pub mod safety;
pub mod search;
pub mod shell;

use crate::clients::ToolDefinition;
use futures::{Future, FutureExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use external::{ExternalTool, ToolDiscovery};
pub use files::{EditFileTool, ListFilesTool, ReadFileTool, WriteFileTool};
pub use safety::{SafetyError, SafetyPolicy};
pub use search::SearchFilesTool;
pub use shell::{RunShellTool, ShellError, ShellReport};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Tool '{name}' execution failed: {error}")]
    ExecutionFailed { name: String, error: String },
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Tool timed out after {0} seconds")]
    Timeout(u64),
}

/// Outcome of one tool invocation. Exactly one of `output` / `error` is set,
/// matching `success`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    success: bool,
    output: Option<String>,
    error: Option<String>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Text placed in the tool-role message answering the call.
    pub fn to_message_content(&self) -> String {
        if self.success {
            self.output.clone().unwrap_or_default()
        } else {
            format!("Error: {}", self.error.as_deref().unwrap_or("Unknown error"))
        }
    }
}

pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<ToolResult, ToolError>> + Send + 'a>>;

pub trait ToolTrait: Send + Sync {
    fn info(&self) -> ToolDefinition;

    /// Runs the tool with the raw JSON argument text produced by the model.
    fn execute<'a>(&'a self, arguments: &'a str) -> ToolFuture<'a>;

    fn is_external(&self) -> bool {
        false
    }
}

/// Root directory plus the safety policy every built-in tool resolves paths through.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    policy: Arc<SafetyPolicy>,
}

impl Workspace {
    pub fn new(root: PathBuf, policy: SafetyPolicy) -> Self {
        Self {
            root,
            policy: Arc::new(policy),
        }
    }

    pub fn unrestricted(root: PathBuf) -> Self {
        Self::new(root, SafetyPolicy::default())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// Expands `~`, anchors relative paths at the root and applies the sandbox.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, SafetyError> {
        let expanded = shellexpand::tilde(raw);
        let path = Path::new(expanded.as_ref());
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        self.policy.check_path(&full)?;
        Ok(full)
    }
}

/// Decodes tool arguments. Blank argument text counts as `{}`.
pub(crate) fn parse_args<T: DeserializeOwned>(arguments: &str) -> Result<T, ToolError> {
    let raw = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} bytes", bytes);
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool panicked".to_string()
    }
}

#[derive(Default)]
pub struct ToolManager {
    tools: HashMap<String, Box<dyn ToolTrait>>,
}

impl ToolManager {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registers a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, tool: Box<dyn ToolTrait>) {
        let name = tool.info().name;
        if self.tools.insert(name.clone(), tool).is_some() {
            debug!(tool = %name, "Replaced existing tool registration");
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolTrait> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn external_count(&self) -> usize {
        self.tools.values().filter(|t| t.is_external()).count()
    }

    /// Tool names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptors for every registered tool, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> =
            self.tools.values().map(|tool| tool.info()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Runs the named tool. Errors and panics inside the tool come back as
    /// [`ToolError::ExecutionFailed`].
    pub async fn execute(&self, name: &str, arguments: &str) -> Result<ToolResult, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        debug!(tool = %name, "Executing tool");
        let outcome = AssertUnwindSafe(async { tool.execute(arguments).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                warn!(tool = %name, error = %e, "Tool returned an error");
                Err(ToolError::ExecutionFailed {
                    name: name.to_string(),
                    error: e.to_string(),
                })
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(tool = %name, panic = %message, "Tool panicked");
                Err(ToolError::ExecutionFailed {
                    name: name.to_string(),
                    error: format!("panicked: {}", message),
                })
            }
        }
    }

    /// Discovers external tools and registers them; a discovered tool may
    /// replace a built-in with the same name. Returns how many were loaded.
    pub async fn load_external_tools(&mut self, discovery: &ToolDiscovery) -> usize {
        let tools = discovery.discover().await;
        let count = tools.len();
        for tool in tools {
            info!(tool = %tool.info().name, path = %tool.executable().display(), "Registering external tool");
            self.register(Box::new(tool));
        }
        count
    }
}

pub fn default_tools(workspace: Workspace, shell_timeout_seconds: u64) -> ToolManager {
    let mut manager = ToolManager::new();

    manager.register(Box::new(ReadFileTool::new(workspace.clone())));
    manager.register(Box::new(WriteFileTool::new(workspace.clone())));
    manager.register(Box::new(EditFileTool::new(workspace.clone())));
    manager.register(Box::new(ListFilesTool::new(workspace.clone())));
    manager.register(Box::new(SearchFilesTool::new(workspace.clone())));
    manager.register(Box::new(RunShellTool::new(workspace, shell_timeout_seconds)));

    manager
}
