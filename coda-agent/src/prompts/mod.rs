use crate::clients::ToolDefinition;
use std::path::Path;

/// Builds the system prompt that opens every session.
///
/// A non-empty `custom` prompt replaces the built-in guidance; the tool list
/// and working directory are appended either way so the model knows what it
/// can call and where relative paths resolve.
pub fn build_system_prompt(tools: &[ToolDefinition], workdir: &Path, custom: Option<&str>) -> String {
    let guidance = match custom.map(str::trim) {
        Some(custom) if !custom.is_empty() => custom.to_string(),
        _ => default_guidance(),
    };

    let tools_section = if tools.is_empty() {
        "You have no tools available.".to_string()
    } else {
        let lines: Vec<String> = tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect();
        format!("## Tools\n{}", lines.join("\n"))
    };

    format!(
        "{}\n\n{}\n\n## Environment\nWorking directory: {}",
        guidance,
        tools_section,
        workdir.display()
    )
}

fn default_guidance() -> String {
    r#"You are a helpful AI coding assistant. You help users with programming tasks.

## Guidelines
1. Use tools when they help answer the question: read files before editing them, search before guessing
2. Prefer small, targeted edits with edit_file over rewriting whole files
3. Paths are relative to the working directory unless absolute
4. When output from a shell command is shared with you, use it to answer
5. Be concise, accurate, and helpful. If you're unsure, say so"#
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ToolParameters;

    fn tool(name: &str, description: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            parameters: ToolParameters::new(),
        }
    }

    #[test]
    fn test_prompt_lists_tools() {
        let tools = vec![tool("read_file", "Read a file"), tool("write_file", "Write a file")];
        let prompt = build_system_prompt(&tools, Path::new("/work"), None);

        assert!(prompt.starts_with("You are a helpful AI coding assistant"));
        assert!(prompt.contains("- read_file: Read a file"));
        assert!(prompt.contains("- write_file: Write a file"));
        assert!(prompt.ends_with("Working directory: /work"));
    }

    #[test]
    fn test_prompt_without_tools() {
        let prompt = build_system_prompt(&[], Path::new("."), None);
        assert!(prompt.contains("no tools available"));
    }

    #[test]
    fn test_custom_prompt_replaces_guidance() {
        let prompt = build_system_prompt(&[tool("run_shell", "Run")], Path::new("."), Some("Be terse."));
        assert!(prompt.starts_with("Be terse.\n\n## Tools"));
        assert!(!prompt.contains("helpful AI coding assistant"));

        let blank = build_system_prompt(&[], Path::new("."), Some("   "));
        assert!(blank.starts_with("You are a helpful AI coding assistant"));
    }
}
