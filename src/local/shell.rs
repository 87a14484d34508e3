//! Local shell resolution
//!
//! Picks the shell a local session runs: `$SHELL` when it points at an
//! existing file, otherwise the first platform fallback that exists.

use std::path::{Path, PathBuf};

/// A resolved shell executable
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellInfo {
    /// Executable file name without extension ("bash", "zsh", "cmd")
    pub id: String,
    pub path: PathBuf,
    pub args: Vec<String>,
}

impl ShellInfo {
    /// Describe the shell at `path` with the default login arguments for its kind
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = shell_id(&path);
        let args = login_args(&id);
        Self { id, path, args }
    }
}

#[cfg(unix)]
const FALLBACK_SHELLS: &[&str] = &["/bin/bash", "/bin/zsh", "/usr/bin/bash", "/bin/sh"];

#[cfg(windows)]
const FALLBACK_SHELLS: &[&str] = &["C:\\Windows\\System32\\cmd.exe"];

/// Resolve the shell for a new local session, or `None` if nothing usable exists
pub fn resolve_shell() -> Option<ShellInfo> {
    resolve_shell_from(std::env::var_os("SHELL").map(PathBuf::from), FALLBACK_SHELLS)
}

fn resolve_shell_from(preferred: Option<PathBuf>, fallbacks: &[&str]) -> Option<ShellInfo> {
    if let Some(path) = preferred.filter(|p| is_executable_file(p)) {
        return Some(ShellInfo::from_path(path));
    }

    #[cfg(windows)]
    if let Some(comspec) = std::env::var_os("COMSPEC").map(PathBuf::from) {
        if is_executable_file(&comspec) {
            return Some(ShellInfo::from_path(comspec));
        }
    }

    let found = fallbacks
        .iter()
        .map(Path::new)
        .find(|p| is_executable_file(p))
        .map(ShellInfo::from_path);

    if found.is_none() {
        tracing::error!("No usable local shell found");
    }
    found
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

fn shell_id(path: &Path) -> String {
    path.file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("shell")
        .to_ascii_lowercase()
}

/// Arguments that start an interactive login shell of the given kind
pub fn login_args(shell_id: &str) -> Vec<String> {
    match shell_id {
        "zsh" | "bash" | "fish" => vec!["--login".to_string()],
        "sh" | "dash" | "ksh" => vec!["-l".to_string()],
        "pwsh" | "powershell" => vec!["-NoLogo".to_string(), "-NoExit".to_string()],
        _ => vec![],
    }
}
