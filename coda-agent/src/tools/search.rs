use super::{ToolFuture, ToolResult, ToolTrait, Workspace, parse_args};
use crate::clients::{ToolDefinition, ToolParameters, ToolProperty};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_MAX_RESULTS: usize = 50;

pub struct SearchFilesTool {
    workspace: Workspace,
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    pattern: String,
    #[serde(default = "default_search_path")]
    path: String,
    #[serde(default = "default_true")]
    recursive: bool,
    #[serde(default)]
    case_insensitive: bool,
    file_pattern: Option<String>,
    max_results: Option<usize>,
}

fn default_search_path() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

struct FileMatches {
    path: String,
    lines: Vec<(usize, String)>,
}

impl SearchFilesTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    fn search_in_file(content: &str, regex: &Regex, budget: usize) -> (Vec<(usize, String)>, bool) {
        let mut matches = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                if matches.len() == budget {
                    return (matches, true);
                }
                matches.push((line_no + 1, line.trim().to_string()));
            }
        }
        (matches, false)
    }

    /// Collects candidate files in sorted order, skipping dot entries.
    fn find_files(
        dir: &Path,
        recursive: bool,
        file_pattern: Option<&glob::Pattern>,
        results: &mut Vec<PathBuf>,
    ) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut entries: Vec<_> = entries.flatten().collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                if recursive {
                    Self::find_files(&path, recursive, file_pattern, results);
                }
            } else if path.is_file() && file_pattern.is_none_or(|p| p.matches(&name)) {
                results.push(path);
            }
        }
    }
}

impl ToolTrait for SearchFilesTool {
    fn info(&self) -> ToolDefinition {
        ToolDefinition {
            name: "search_files".to_string(),
            description: "Search file contents with a regular expression. Results are grouped by file with line numbers.".to_string(),
            parameters: ToolParameters::new()
                .property("pattern", ToolProperty::string("Regular expression to search for"), true)
                .property("path", ToolProperty::string("Directory to search in (default: current directory)"), false)
                .property("recursive", ToolProperty::boolean("Search subdirectories (default: true)"), false)
                .property("case_insensitive", ToolProperty::boolean("Ignore case when matching"), false)
                .property("file_pattern", ToolProperty::string("Only search files whose name matches this glob (e.g. *.rs)"), false)
                .property("max_results", ToolProperty::integer("Maximum number of matches to return (default 50)"), false),
        }
    }

    fn execute<'a>(&'a self, arguments: &'a str) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: SearchArgs = parse_args(arguments)?;
            let search_path = match self.workspace.resolve(&args.path) {
                Ok(path) => path,
                Err(e) => return Ok(ToolResult::failure(e.to_string())),
            };

            let regex = match RegexBuilder::new(&args.pattern)
                .case_insensitive(args.case_insensitive)
                .build()
            {
                Ok(regex) => regex,
                Err(e) => return Ok(ToolResult::failure(format!("Invalid regex pattern: {}", e))),
            };

            let file_pattern = match args.file_pattern.as_deref().map(glob::Pattern::new).transpose() {
                Ok(pattern) => pattern,
                Err(e) => return Ok(ToolResult::failure(format!("Invalid file pattern: {}", e))),
            };

            let mut files = Vec::new();
            if search_path.is_file() {
                files.push(search_path.clone());
            } else if search_path.is_dir() {
                Self::find_files(&search_path, args.recursive, file_pattern.as_ref(), &mut files);
            } else {
                return Ok(ToolResult::failure(format!("Path not found: {}", args.path)));
            }

            let max_results = args.max_results.unwrap_or(DEFAULT_MAX_RESULTS).max(1);
            let mut groups: Vec<FileMatches> = Vec::new();
            let mut total = 0;
            let mut truncated = false;

            for file in files {
                if total == max_results {
                    truncated = true;
                    break;
                }
                // Unreadable or binary files are skipped.
                let Ok(content) = tokio::fs::read_to_string(&file).await else {
                    continue;
                };
                let (lines, more) = Self::search_in_file(&content, &regex, max_results - total);
                truncated |= more;
                if lines.is_empty() {
                    continue;
                }
                total += lines.len();
                let relative = file
                    .strip_prefix(&search_path)
                    .ok()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or(file.as_path());
                groups.push(FileMatches {
                    path: relative.display().to_string(),
                    lines,
                });
            }

            if groups.is_empty() {
                return Ok(ToolResult::success(format!(
                    "No matches found for pattern: {}",
                    args.pattern
                )));
            }

            let mut output = format!("Found {} matches", total);
            if truncated {
                output.push_str(&format!(" (showing first {})", max_results));
            }
            output.push_str(":\n");
            for group in groups {
                output.push_str(&format!("\n{} ({} matches):\n", group.path, group.lines.len()));
                for (line_no, text) in group.lines {
                    output.push_str(&format!("   {}: {}\n", line_no, text));
                }
            }

            Ok(ToolResult::success(output.trim_end().to_string()))
        })
    }
}
