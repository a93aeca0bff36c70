use super::{ToolFuture, ToolResult, ToolTrait, Workspace, format_size, parse_args};
use crate::clients::{ToolDefinition, ToolParameters, ToolProperty};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::debug;

const DEFAULT_READ_LIMIT: usize = 500;
const DIFF_CONTEXT_LINES: usize = 2;

pub struct ReadFileTool {
    workspace: Workspace,
}

impl ReadFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[derive(Debug, Deserialize)]
struct ReadFileArgs {
    path: String,
    offset: Option<usize>,
    limit: Option<usize>,
}

impl ToolTrait for ReadFileTool {
    fn info(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".to_string(),
            description: "Read the contents of a file with line numbers. Use offset and limit to page through large files.".to_string(),
            parameters: ToolParameters::new()
                .property("path", ToolProperty::string("Path to the file to read"), true)
                .property(
                    "offset",
                    ToolProperty::integer("Line number to start reading from (1-indexed)"),
                    false,
                )
                .property(
                    "limit",
                    ToolProperty::integer("Maximum number of lines to read (default 500)"),
                    false,
                ),
        }
    }

    fn execute<'a>(&'a self, arguments: &'a str) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: ReadFileArgs = parse_args(arguments)?;
            let full_path = match self.workspace.resolve(&args.path) {
                Ok(path) => path,
                Err(e) => return Ok(ToolResult::failure(e.to_string())),
            };

            if !full_path.is_file() {
                return Ok(ToolResult::failure(format!("File not found: {}", args.path)));
            }

            let content = match tokio::fs::read_to_string(&full_path).await {
                Ok(content) => content,
                Err(e) => return Ok(ToolResult::failure(format!("Failed to read file: {}", e))),
            };

            let lines: Vec<&str> = content.split('\n').collect();
            let total = lines.len();
            let start = args.offset.unwrap_or(1).max(1) - 1;
            if start >= total {
                return Ok(ToolResult::failure(format!(
                    "Offset {} exceeds file length ({} lines)",
                    start + 1,
                    total
                )));
            }
            let limit = args.limit.unwrap_or(DEFAULT_READ_LIMIT).max(1);
            let end = (start + limit).min(total);

            let mut output = format!(
                "File: {}\nLines: {}-{} of {} total\n\n",
                args.path,
                start + 1,
                end,
                total
            );
            let numbered: Vec<String> = lines[start..end]
                .iter()
                .enumerate()
                .map(|(i, line)| format!("{}: {}", start + i + 1, line))
                .collect();
            output.push_str(&numbered.join("\n"));

            Ok(ToolResult::success(output))
        })
    }
}

pub struct WriteFileTool {
    workspace: Workspace,
}

impl WriteFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[derive(Debug, Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

impl ToolTrait for WriteFileTool {
    fn info(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_file".to_string(),
            description: "Write content to a file, creating parent directories and overwriting any existing file.".to_string(),
            parameters: ToolParameters::new()
                .property("path", ToolProperty::string("Path to the file to write"), true)
                .property("content", ToolProperty::string("Content to write to the file"), true),
        }
    }

    fn execute<'a>(&'a self, arguments: &'a str) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: WriteFileArgs = parse_args(arguments)?;
            let full_path = match self.workspace.resolve(&args.path) {
                Ok(path) => path,
                Err(e) => return Ok(ToolResult::failure(e.to_string())),
            };

            if let Some(parent) = full_path.parent() {
                if !parent.exists() {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        return Ok(ToolResult::failure(format!(
                            "Failed to create directory {}: {}",
                            parent.display(),
                            e
                        )));
                    }
                }
            }

            if let Err(e) = tokio::fs::write(&full_path, args.content.as_bytes()).await {
                return Ok(ToolResult::failure(format!("Failed to write file: {}", e)));
            }

            debug!(path = %full_path.display(), bytes = args.content.len(), "Wrote file");
            Ok(ToolResult::success(format!(
                "File written successfully: {} ({})",
                args.path,
                format_size(args.content.len() as u64)
            )))
        })
    }
}

pub struct EditFileTool {
    workspace: Workspace,
}

impl EditFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[derive(Debug, Deserialize)]
struct EditFileArgs {
    path: String,
    search: String,
    replace: String,
    #[serde(default)]
    fuzzy: bool,
}

/// Byte ranges of every non-overlapping occurrence of `search` in `content`.
fn find_exact(content: &str, search: &str) -> Vec<(usize, usize)> {
    content
        .match_indices(search)
        .map(|(start, matched)| (start, start + matched.len()))
        .collect()
}

/// Collapses whitespace runs to a single space, keeping a map from each
/// normalised byte offset back to the original text. The map has one extra
/// entry for the end of the text.
fn normalize_whitespace(text: &str) -> (String, Vec<usize>) {
    let mut normalized = String::with_capacity(text.len());
    let mut offsets = Vec::with_capacity(text.len() + 1);
    let mut in_whitespace = false;

    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if !in_whitespace {
                normalized.push(' ');
                offsets.push(idx);
                in_whitespace = true;
            }
        } else {
            in_whitespace = false;
            normalized.push(ch);
            offsets.extend(std::iter::repeat_n(idx, ch.len_utf8()));
        }
    }
    offsets.push(text.len());
    (normalized, offsets)
}

fn find_fuzzy(content: &str, search: &str) -> Vec<(usize, usize)> {
    let (haystack, offsets) = normalize_whitespace(content);
    let (needle, _) = normalize_whitespace(search);
    if needle.is_empty() {
        return Vec::new();
    }
    haystack
        .match_indices(&needle)
        .map(|(start, matched)| (offsets[start], offsets[start + matched.len()]))
        .collect()
}

/// Numbered before/after view of the edited region with a little context.
fn diff_snippet(original: &str, updated: &str, start: usize, old_end: usize, replacement: &str) -> String {
    let old_lines: Vec<&str> = original.split('\n').collect();
    let new_lines: Vec<&str> = updated.split('\n').collect();

    let first = original[..start].matches('\n').count();
    let old_last = first + original[start..old_end].matches('\n').count();
    let new_last = first + replacement.matches('\n').count();

    let mut out = Vec::new();
    for idx in first.saturating_sub(DIFF_CONTEXT_LINES)..first {
        out.push(format!("  {}: {}", idx + 1, old_lines[idx]));
    }
    for idx in first..=old_last.min(old_lines.len() - 1) {
        out.push(format!("- {}: {}", idx + 1, old_lines[idx]));
    }
    for idx in first..=new_last.min(new_lines.len() - 1) {
        out.push(format!("+ {}: {}", idx + 1, new_lines[idx]));
    }
    let after_end = (new_last + 1 + DIFF_CONTEXT_LINES).min(new_lines.len());
    for idx in (new_last + 1)..after_end {
        out.push(format!("  {}: {}", idx + 1, new_lines[idx]));
    }
    out.join("\n")
}

impl ToolTrait for EditFileTool {
    fn info(&self) -> ToolDefinition {
        ToolDefinition {
            name: "edit_file".to_string(),
            description: "Replace one unique occurrence of search text in a file. Fails if the text is missing or appears more than once.".to_string(),
            parameters: ToolParameters::new()
                .property("path", ToolProperty::string("Path to the file to edit"), true)
                .property("search", ToolProperty::string("Exact text to find"), true)
                .property("replace", ToolProperty::string("Replacement text"), true)
                .property(
                    "fuzzy",
                    ToolProperty::boolean("Treat any run of whitespace as equivalent when matching"),
                    false,
                ),
        }
    }

    fn execute<'a>(&'a self, arguments: &'a str) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: EditFileArgs = parse_args(arguments)?;
            let full_path = match self.workspace.resolve(&args.path) {
                Ok(path) => path,
                Err(e) => return Ok(ToolResult::failure(e.to_string())),
            };

            if args.search.is_empty() {
                return Ok(ToolResult::failure("Search text must not be empty"));
            }
            if !full_path.is_file() {
                return Ok(ToolResult::failure(format!("File not found: {}", args.path)));
            }

            let original = match tokio::fs::read_to_string(&full_path).await {
                Ok(content) => content,
                Err(e) => return Ok(ToolResult::failure(format!("Failed to read file: {}", e))),
            };

            let matches = if args.fuzzy {
                find_fuzzy(&original, &args.search)
            } else {
                find_exact(&original, &args.search)
            };

            let (start, end) = match matches.as_slice() {
                [] => return Ok(ToolResult::failure("Search text not found in file")),
                [single] => *single,
                many => {
                    return Ok(ToolResult::failure(format!(
                        "Search text appears {} times in file. Please provide more context to make search text unique.",
                        many.len()
                    )));
                }
            };

            let mut updated = String::with_capacity(original.len() + args.replace.len());
            updated.push_str(&original[..start]);
            updated.push_str(&args.replace);
            updated.push_str(&original[end..]);

            if let Err(e) = tokio::fs::write(&full_path, updated.as_bytes()).await {
                return Ok(ToolResult::failure(format!("Failed to write file: {}", e)));
            }

            let diff = diff_snippet(&original, &updated, start, end, &args.replace);
            Ok(ToolResult::success(format!(
                "File edited successfully: {}\n\nChanges:\n{}",
                args.path, diff
            )))
        })
    }
}

pub struct ListFilesTool {
    workspace: Workspace,
}

impl ListFilesTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[derive(Debug, Deserialize)]
struct ListFilesArgs {
    #[serde(default = "default_list_path")]
    path: String,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    show_hidden: bool,
}

fn default_list_path() -> String {
    ".".to_string()
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn collect_entries(
    dir: &Path,
    prefix: &str,
    recursive: bool,
    show_hidden: bool,
    out: &mut Vec<String>,
) -> std::io::Result<()> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.filter_map(Result::ok).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !show_hidden && is_hidden(&name) {
            continue;
        }
        let display = format!("{}{}", prefix, name);
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            out.push(format!("{}/", display));
            if recursive {
                collect_entries(&entry.path(), &format!("{}/", display), recursive, show_hidden, out)?;
            }
        } else {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            out.push(format!("{} ({})", display, format_size(size)));
        }
    }
    Ok(())
}

impl ToolTrait for ListFilesTool {
    fn info(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_files".to_string(),
            description: "List files and directories. Directories end with '/', files show their size.".to_string(),
            parameters: ToolParameters::new()
                .property("path", ToolProperty::string("Directory to list (default: current directory)"), false)
                .property("recursive", ToolProperty::boolean("List subdirectories recursively"), false)
                .property("show_hidden", ToolProperty::boolean("Include entries starting with '.'"), false),
        }
    }

    fn execute<'a>(&'a self, arguments: &'a str) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: ListFilesArgs = parse_args(arguments)?;
            let full_path = match self.workspace.resolve(&args.path) {
                Ok(path) => path,
                Err(e) => return Ok(ToolResult::failure(e.to_string())),
            };

            if !full_path.exists() {
                return Ok(ToolResult::failure(format!("Path not found: {}", args.path)));
            }
            if !full_path.is_dir() {
                return Ok(ToolResult::failure(format!("Path is not a directory: {}", args.path)));
            }

            let mut entries = Vec::new();
            if let Err(e) = collect_entries(&full_path, "", args.recursive, args.show_hidden, &mut entries) {
                return Ok(ToolResult::failure(format!("Failed to list directory: {}", e)));
            }

            if entries.is_empty() {
                return Ok(ToolResult::success(format!("Directory is empty: {}", args.path)));
            }
            Ok(ToolResult::success(format!(
                "Contents of {}:\n{}",
                args.path,
                entries.join("\n")
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn workspace(dir: &TempDir) -> Workspace {
        Workspace::unrestricted(dir.path().to_path_buf())
    }

    fn args(value: serde_json::Value) -> String {
        value.to_string()
    }

    #[tokio::test]
    async fn test_read_file_numbers_lines() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "one\ntwo\nthree").unwrap();
        let tool = ReadFileTool::new(workspace(&dir));

        let result = tool
            .execute(&args(serde_json::json!({"path": "a.txt", "offset": 2, "limit": 1})))
            .await
            .unwrap();
        assert_eq!(result.output(), Some("File: a.txt\nLines: 2-2 of 3 total\n\n2: two"));
    }

    #[tokio::test]
    async fn test_read_file_offset_past_end() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "one\ntwo").unwrap();
        let tool = ReadFileTool::new(workspace(&dir));

        let result = tool
            .execute(&args(serde_json::json!({"path": "a.txt", "offset": 5})))
            .await
            .unwrap();
        assert_eq!(result.error(), Some("Offset 5 exceeds file length (2 lines)"));
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = TempDir::new().unwrap();
        let tool = ReadFileTool::new(workspace(&dir));
        let result = tool.execute(r#"{"path": "nope.txt"}"#).await.unwrap();
        assert_eq!(result.error(), Some("File not found: nope.txt"));
    }

    #[tokio::test]
    async fn test_read_requires_path() {
        let dir = TempDir::new().unwrap();
        let tool = ReadFileTool::new(workspace(&dir));
        assert!(tool.execute("{}").await.is_err());
    }

    #[tokio::test]
    async fn test_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let tool = WriteFileTool::new(workspace(&dir));
        let result = tool
            .execute(&args(serde_json::json!({"path": "nested/deep/out.txt", "content": "hello"})))
            .await
            .unwrap();
        assert_eq!(
            result.output(),
            Some("File written successfully: nested/deep/out.txt (5 bytes)")
        );
        assert_eq!(fs::read_to_string(dir.path().join("nested/deep/out.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_edit_rejects_ambiguous_search() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "ab ab ab").unwrap();
        let tool = EditFileTool::new(workspace(&dir));

        let result = tool
            .execute(&args(serde_json::json!({"path": "f.txt", "search": "ab", "replace": "x"})))
            .await
            .unwrap();
        assert!(!result.is_success());
        assert!(result.error().unwrap().starts_with("Search text appears 3 times in file"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "ab ab ab");
    }

    #[tokio::test]
    async fn test_edit_whole_repeated_text_is_unique() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "ab ab ab").unwrap();
        let tool = EditFileTool::new(workspace(&dir));

        let result = tool
            .execute(&args(serde_json::json!({"path": "f.txt", "search": "ab ab ab", "replace": "done"})))
            .await
            .unwrap();
        assert!(result.is_success(), "{:?}", result.error());
        assert_eq!(fs::read_to_string(&path).unwrap(), "done");
    }

    #[tokio::test]
    async fn test_edit_not_found() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f.txt"), "hello").unwrap();
        let tool = EditFileTool::new(workspace(&dir));
        let result = tool
            .execute(&args(serde_json::json!({"path": "f.txt", "search": "bye", "replace": "x"})))
            .await
            .unwrap();
        assert_eq!(result.error(), Some("Search text not found in file"));
    }

    #[tokio::test]
    async fn test_edit_unique_match_with_diff() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.rs");
        fs::write(&path, "a\nb\nfn old() {}\nc\nd\ne").unwrap();
        let tool = EditFileTool::new(workspace(&dir));

        let result = tool
            .execute(&args(serde_json::json!({"path": "f.rs", "search": "old", "replace": "new"})))
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nb\nfn new() {}\nc\nd\ne");
        assert_eq!(
            result.output(),
            Some(
                "File edited successfully: f.rs\n\nChanges:\n  1: a\n  2: b\n- 3: fn old() {}\n+ 3: fn new() {}\n  4: c\n  5: d"
            )
        );
    }

    #[tokio::test]
    async fn test_edit_fuzzy_whitespace() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.py");
        fs::write(&path, "if x:\n\treturn   1\nend").unwrap();
        let tool = EditFileTool::new(workspace(&dir));

        let strict = tool
            .execute(&args(serde_json::json!({"path": "f.py", "search": "x: return 1", "replace": "y"})))
            .await
            .unwrap();
        assert!(!strict.is_success());

        let fuzzy = tool
            .execute(&args(serde_json::json!({"path": "f.py", "search": "x: return 1", "replace": "y:", "fuzzy": true})))
            .await
            .unwrap();
        assert!(fuzzy.is_success());
        assert_eq!(fs::read_to_string(&path).unwrap(), "if y:\nend");
    }

    #[rstest]
    #[case("a  b", "a b", vec![(0, 4)])]
    #[case("xx a\n\tb yy", "a b", vec![(3, 7)])]
    #[case("a b a b", "a b", vec![(0, 3), (4, 7)])]
    #[case("ab", "a b", vec![])]
    fn test_find_fuzzy_ranges(
        #[case] content: &str,
        #[case] search: &str,
        #[case] expected: Vec<(usize, usize)>,
    ) {
        assert_eq!(find_fuzzy(content, search), expected);
    }

    #[tokio::test]
    async fn test_list_files_hides_dot_entries() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.txt"), "12").unwrap();
        fs::write(dir.path().join(".secret"), "x").unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("a/inner.txt"), "").unwrap();
        let tool = ListFilesTool::new(workspace(&dir));

        let result = tool.execute("{}").await.unwrap();
        assert_eq!(result.output(), Some("Contents of .:\na/\nb.txt (2 bytes)"));

        let result = tool
            .execute(r#"{"recursive": true, "show_hidden": true}"#)
            .await
            .unwrap();
        assert_eq!(
            result.output(),
            Some("Contents of .:\n.secret (1 bytes)\na/\na/inner.txt (0 bytes)\nb.txt (2 bytes)")
        );
    }

    #[tokio::test]
    async fn test_list_files_errors() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("file.txt"), "").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        let tool = ListFilesTool::new(workspace(&dir));

        let result = tool.execute(r#"{"path": "missing"}"#).await.unwrap();
        assert_eq!(result.error(), Some("Path not found: missing"));
        let result = tool.execute(r#"{"path": "file.txt"}"#).await.unwrap();
        assert_eq!(result.error(), Some("Path is not a directory: file.txt"));
        let result = tool.execute(r#"{"path": "empty"}"#).await.unwrap();
        assert_eq!(result.output(), Some("Directory is empty: empty"));
    }

    #[tokio::test]
    async fn test_sandbox_blocks_outside_paths() {
        let dir = TempDir::new().unwrap();
        let config = crate::config::SafetyConfig {
            sandbox_enabled: true,
            ..crate::config::SafetyConfig::default()
        };
        let workspace = Workspace::new(
            dir.path().to_path_buf(),
            crate::tools::SafetyPolicy::from_config(&config, dir.path()),
        );
        let tool = ReadFileTool::new(workspace);
        let result = tool.execute(r#"{"path": "/etc/hostname"}"#).await.unwrap();
        assert!(result.error().unwrap().starts_with("Sandbox violation"));
    }
}
