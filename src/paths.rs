use std::path::{Path, PathBuf};

/// Best-effort home directory resolution.
///
/// `dirs::home_dir()` can come back empty under launch agents and some test harnesses, so we
/// also consult the usual environment variables before giving up.
pub fn user_home_dir() -> Option<PathBuf> {
    dirs::home_dir()
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .or_else(|| std::env::var_os("USERPROFILE").map(PathBuf::from))
}

/// `AUTOFILL_DIR`, when set to something non-blank.
pub fn root_dir_override() -> Option<PathBuf> {
    let raw = std::env::var("AUTOFILL_DIR").ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

/// Root of all autofill state: vault, mapping blob, account list, and the bridge run dir.
///
/// Without a resolvable home directory we land in an absolute temp directory rather than the
/// current working directory.
pub fn autofill_root_dir() -> PathBuf {
    if let Some(dir) = root_dir_override() {
        return dir;
    }
    match user_home_dir() {
        Some(home) => home.join(".autofill"),
        None => std::env::temp_dir().join("autofill-no-home"),
    }
}

pub fn run_dir() -> PathBuf {
    autofill_root_dir().join("run")
}

/// State owned by the unprivileged agent (its mapping cache).
pub fn agent_dir() -> PathBuf {
    autofill_root_dir().join("agent")
}

/// Set unix permission bits on `path`.
#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;
    let perm = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(path, perm)
        .map_err(|e| format!("failed to set mode {:o} on {}: {}", mode, path.display(), e))
}
