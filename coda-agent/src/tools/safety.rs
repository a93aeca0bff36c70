use crate::config::SafetyConfig;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("Sandbox violation: Cannot access {0}")]
    SandboxViolation(String),
    #[error("Blocked command for safety: {0}")]
    BlockedCommand(String),
}

/// Path and command restrictions applied before tools touch the system.
///
/// The command blocklist is always enforced. Path checks only apply when the
/// sandbox is enabled.
#[derive(Debug, Clone, Default)]
pub struct SafetyPolicy {
    sandbox_enabled: bool,
    allowed_roots: Vec<PathBuf>,
    blocked_roots: Vec<PathBuf>,
    blocked_commands: Vec<String>,
}

impl SafetyPolicy {
    pub fn from_config(config: &SafetyConfig, workdir: &Path) -> Self {
        let anchor = |raw: &String| {
            let expanded = shellexpand::tilde(raw);
            let path = Path::new(expanded.as_ref());
            if path.is_absolute() {
                normalize(path)
            } else {
                normalize(&workdir.join(path))
            }
        };

        Self {
            sandbox_enabled: config.sandbox_enabled,
            allowed_roots: config.sandbox_allowed_paths.iter().map(anchor).collect(),
            blocked_roots: config.sandbox_blocked_paths.iter().map(anchor).collect(),
            blocked_commands: config
                .blocked_commands
                .iter()
                .map(|c| collapse_whitespace(c))
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }

    pub fn sandbox_enabled(&self) -> bool {
        self.sandbox_enabled
    }

    pub fn check_path(&self, path: &Path) -> Result<(), SafetyError> {
        if !self.sandbox_enabled {
            return Ok(());
        }

        let path = normalize(path);
        let violation = || SafetyError::SandboxViolation(path.display().to_string());

        if self.blocked_roots.iter().any(|root| path.starts_with(root)) {
            return Err(violation());
        }
        if !self.allowed_roots.is_empty() && !self.allowed_roots.iter().any(|root| path.starts_with(root)) {
            return Err(violation());
        }
        Ok(())
    }

    /// Rejects commands containing a blocked pattern (case-insensitive,
    /// whitespace-insensitive).
    pub fn check_command(&self, command: &str) -> Result<(), SafetyError> {
        let normalized = collapse_whitespace(command);
        match self.blocked_commands.iter().find(|pattern| normalized.contains(pattern.as_str())) {
            Some(_) => Err(SafetyError::BlockedCommand(command.trim().to_string())),
            None => Ok(()),
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Lexical normalisation: drops `.` and resolves `..` without touching the
/// filesystem, so paths that do not exist yet can be checked.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sandboxed() -> SafetyPolicy {
        let config = SafetyConfig {
            sandbox_enabled: true,
            sandbox_allowed_paths: vec!["./".to_string()],
            sandbox_blocked_paths: vec!["/work/secrets".to_string()],
            ..SafetyConfig::default()
        };
        SafetyPolicy::from_config(&config, Path::new("/work"))
    }

    #[rstest]
    #[case("/work/src/main.rs", true)]
    #[case("/work/./new/file.txt", true)]
    #[case("/work/../etc/passwd", false)]
    #[case("/etc/passwd", false)]
    #[case("/work/secrets/key", false)]
    fn test_sandbox_paths(#[case] path: &str, #[case] allowed: bool) {
        assert_eq!(sandboxed().check_path(Path::new(path)).is_ok(), allowed);
    }

    #[test]
    fn test_disabled_sandbox_allows_everything() {
        let policy = SafetyPolicy::from_config(&SafetyConfig::default(), Path::new("/work"));
        assert!(policy.check_path(Path::new("/etc/passwd")).is_ok());
    }

    #[rstest]
    #[case("rm -rf /", false)]
    #[case("rm   -rf   /tmp", false)]
    #[case("SUDO apt install", false)]
    #[case("chmod 777 file", false)]
    #[case("ls -la", true)]
    #[case("rm -rf ./build", true)]
    fn test_blocked_commands(#[case] command: &str, #[case] allowed: bool) {
        let policy = SafetyPolicy::from_config(&SafetyConfig::default(), Path::new("/work"));
        assert_eq!(policy.check_command(command).is_ok(), allowed);
    }

    #[test]
    fn test_violation_message() {
        let err = sandboxed().check_path(Path::new("/etc/hosts")).unwrap_err();
        assert_eq!(err.to_string(), "Sandbox violation: Cannot access /etc/hosts");
    }
}
