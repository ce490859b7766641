//! Agent binary resolution.
//!
//! The agent is built per platform as `<install-dir>/go/meshlink_<os>_<arch>`
//! (plus `.exe` on Windows). OS and arch names follow the agent build's
//! conventions, so `macos` becomes `darwin` and so on. PATH is never searched.

use meshlink_types::{MeshLinkError, MeshLinkResult};
use std::path::{Path, PathBuf};

/// Directory under the install dir that holds agent builds.
pub const AGENT_SUBDIR: &str = "go";

/// Common prefix of every agent build.
pub const BINARY_PREFIX: &str = "meshlink";

/// Resolves the platform-specific agent executable.
#[derive(Debug, Clone)]
pub struct AgentLocator {
    install_dir: PathBuf,
}

impl AgentLocator {
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Where the agent for this platform should be, whether or not it exists.
    pub fn expected_path(&self) -> PathBuf {
        self.install_dir.join(AGENT_SUBDIR).join(binary_name())
    }

    /// Path of the agent executable. `NotFound` if it has not been built.
    pub fn resolve(&self) -> MeshLinkResult<PathBuf> {
        let path = self.expected_path();
        if path.is_file() {
            Ok(path)
        } else {
            Err(MeshLinkError::NotFound(path))
        }
    }
}

/// Agent binary name for the running platform.
pub fn binary_name() -> String {
    binary_name_for(std::env::consts::OS, std::env::consts::ARCH)
}

/// Agent binary name for an arbitrary OS/arch pair.
pub fn binary_name_for(os: &str, arch: &str) -> String {
    let os = normalize_os(os);
    let arch = normalize_arch(&os, arch);
    if os == "windows" {
        format!("{BINARY_PREFIX}_{os}_{arch}.exe")
    } else {
        format!("{BINARY_PREFIX}_{os}_{arch}")
    }
}

fn normalize_os(os: &str) -> String {
    match os.to_lowercase().as_str() {
        "macos" => "darwin".to_string(),
        other => other.to_string(),
    }
}

fn normalize_arch(os: &str, arch: &str) -> String {
    let arch = arch.to_lowercase();
    match (os, arch.as_str()) {
        ("windows", "x86_64") => "amd64".to_string(),
        ("windows" | "darwin", "aarch64") => "arm64".to_string(),
        _ => arch,
    }
}

/// Whether `path` is a file the current user could execute.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Whether `path` is a file the current user could execute.
#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}
