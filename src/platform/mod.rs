use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Ask the process identified by `pid` to stop what it is doing
    /// (SIGINT on Unix). The process may ignore it.
    fn interrupt_process(pid: u32) -> std::io::Result<std::process::Output>;

    /// Send a termination signal to the process identified by `pid`.
    fn kill_process(pid: u32) -> std::io::Result<std::process::Output>;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Root data directory for agentbox.
    /// Unix: `~/.agentbox`, Windows: `%APPDATA%\agentbox`.
    fn data_dir() -> PathBuf;
}

/// `AGENTBOX_DATA_DIR` wins over the platform default.
fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var_os("AGENTBOX_DATA_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
