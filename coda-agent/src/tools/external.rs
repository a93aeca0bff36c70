use super::process::{self, ProcessError};
use super::{ToolError, ToolFuture, ToolResult, ToolTrait};
use crate::clients::{ToolDefinition, ToolParameters, ToolProperty};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Self-description printed by an external tool for `--schema`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExternalToolSchema {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ExternalParameter>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExternalParameter {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

fn default_kind() -> String {
    "string".to_string()
}

#[derive(Debug, Deserialize)]
struct ExternalResponse {
    success: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

/// Tool backed by an executable: arguments go to its stdin as JSON, the
/// result comes back on stdout.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    executable: PathBuf,
    schema: ExternalToolSchema,
    timeout: Duration,
}

impl ExternalTool {
    pub fn new(executable: PathBuf, schema: ExternalToolSchema, timeout: Duration) -> Self {
        Self {
            executable,
            schema,
            timeout,
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn interpret(&self, stdout: &str, stderr: &str, exit_code: i32) -> ToolResult {
        if exit_code != 0 {
            let mut message = format!("Tool failed with exit code {}", exit_code);
            if !stderr.trim().is_empty() {
                message.push_str(&format!("\nStderr: {}", stderr.trim_end()));
            }
            return ToolResult::failure(message);
        }

        match serde_json::from_str::<ExternalResponse>(stdout) {
            Ok(response) => {
                if let Some(metadata) = response.metadata.filter(|m| !m.is_empty()) {
                    debug!(tool = %self.schema.name, ?metadata, "External tool metadata");
                }
                if response.success {
                    ToolResult::success(response.result.unwrap_or_default())
                } else {
                    ToolResult::failure(response.error.unwrap_or_else(|| "Unknown error".to_string()))
                }
            }
            Err(_) => ToolResult::success(stdout.trim_end().to_string()),
        }
    }
}

impl ToolTrait for ExternalTool {
    fn info(&self) -> ToolDefinition {
        let parameters = self
            .schema
            .parameters
            .iter()
            .fold(ToolParameters::new(), |params, (name, param)| {
                params.property(
                    name,
                    ToolProperty::new(param.kind.clone(), param.description.clone()),
                    param.required,
                )
            });
        ToolDefinition {
            name: self.schema.name.clone(),
            description: self.schema.description.clone(),
            parameters,
        }
    }

    fn execute<'a>(&'a self, arguments: &'a str) -> ToolFuture<'a> {
        Box::pin(async move {
            let input = if arguments.trim().is_empty() {
                b"{}".to_vec()
            } else {
                arguments.as_bytes().to_vec()
            };

            debug!(tool = %self.schema.name, path = %self.executable.display(), "Running external tool");
            let output = match process::run(Command::new(&self.executable), Some(input), self.timeout).await {
                Ok(output) => output,
                Err(ProcessError::TimedOut(limit)) => {
                    return Ok(ToolResult::failure(ToolError::Timeout(limit.as_secs()).to_string()));
                }
                Err(e) => return Ok(ToolResult::failure(e.to_string())),
            };

            Ok(self.interpret(&output.stdout, &output.stderr, output.exit_code()))
        })
    }

    fn is_external(&self) -> bool {
        true
    }
}

/// Finds external tool executables under a set of directories.
#[derive(Debug, Clone)]
pub struct ToolDiscovery {
    search_paths: Vec<String>,
    tool_timeout: Duration,
}

impl ToolDiscovery {
    pub fn new(search_paths: Vec<String>, tool_timeout: Duration) -> Self {
        Self {
            search_paths,
            tool_timeout,
        }
    }

    pub fn search_paths(&self) -> &[String] {
        &self.search_paths
    }

    /// Scans every search path and returns the tools that answered the
    /// schema probe. Paths that do not exist are skipped.
    pub async fn discover(&self) -> Vec<ExternalTool> {
        let mut tools = Vec::new();
        for raw in &self.search_paths {
            let dir = PathBuf::from(shellexpand::tilde(raw).as_ref());
            if !dir.is_dir() {
                debug!(path = %dir.display(), "Tool search path not found");
                continue;
            }

            let mut candidates = Vec::new();
            collect_executables(&dir, &mut candidates);
            for path in candidates {
                if let Some(tool) = self.probe(&path).await {
                    tools.push(tool);
                }
            }
        }
        info!(count = tools.len(), "External tool discovery finished");
        tools
    }

    async fn probe(&self, path: &Path) -> Option<ExternalTool> {
        let mut command = Command::new(path);
        command.arg("--schema");

        let output = match process::run(command, None, PROBE_TIMEOUT).await {
            Ok(output) => output,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Schema probe failed");
                return None;
            }
        };
        if output.exit_code() != 0 {
            debug!(path = %path.display(), code = output.exit_code(), "Schema probe exited non-zero");
            return None;
        }

        match serde_json::from_str::<ExternalToolSchema>(output.stdout.trim()) {
            Ok(schema) if !schema.name.trim().is_empty() => {
                Some(ExternalTool::new(path.to_path_buf(), schema, self.tool_timeout))
            }
            Ok(_) => None,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Not a tool schema");
                None
            }
        }
    }
}

fn collect_executables(dir: &Path, results: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            collect_executables(&path, results);
        } else if is_executable(&path) {
            results.push(path);
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> ExternalTool {
        ExternalTool::new(
            PathBuf::from("/bin/true"),
            ExternalToolSchema {
                name: "word_count".to_string(),
                description: "Counts words".to_string(),
                parameters: BTreeMap::from([
                    (
                        "text".to_string(),
                        ExternalParameter {
                            kind: "string".to_string(),
                            description: "Input".to_string(),
                            required: true,
                        },
                    ),
                    (
                        "verbose".to_string(),
                        ExternalParameter {
                            kind: "boolean".to_string(),
                            description: String::new(),
                            required: false,
                        },
                    ),
                ]),
            },
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_schema_becomes_definition() {
        let info = tool().info();
        assert_eq!(info.name, "word_count");
        assert_eq!(info.parameters.required, vec!["text".to_string()]);
        assert_eq!(info.parameters.properties["verbose"].kind, "boolean");
        assert!(tool().is_external());
    }

    #[test]
    fn test_schema_json_decoding() {
        let schema: ExternalToolSchema = serde_json::from_str(
            r#"{"name":"x","description":"d","parameters":{"a":{"type":"string","description":"p","required":true}}}"#,
        )
        .unwrap();
        assert!(schema.parameters["a"].required);

        let bare: ExternalToolSchema = serde_json::from_str(r#"{"name":"y","description":"d"}"#).unwrap();
        assert!(bare.parameters.is_empty());
    }

    #[test]
    fn test_interpret_responses() {
        let t = tool();
        let ok = t.interpret(r#"{"success":true,"result":"5 words","metadata":{"k":"v"}}"#, "", 0);
        assert_eq!(ok.output(), Some("5 words"));

        let failed = t.interpret(r#"{"success":false,"error":"empty input"}"#, "", 0);
        assert_eq!(failed.error(), Some("empty input"));

        let failed = t.interpret(r#"{"success":false}"#, "", 0);
        assert_eq!(failed.error(), Some("Unknown error"));

        let plain = t.interpret("42\n", "", 0);
        assert_eq!(plain.output(), Some("42"));

        let crashed = t.interpret(r#"{"success":true,"result":"ignored"}"#, "boom\n", 3);
        assert_eq!(crashed.error(), Some("Tool failed with exit code 3\nStderr: boom"));
    }
}
