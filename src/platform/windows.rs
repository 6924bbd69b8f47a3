use std::path::{Path, PathBuf};

use super::{Platform, resolve_data_dir};

pub struct NativePlatform;

impl Platform for NativePlatform {
    fn interrupt_process(pid: u32) -> std::io::Result<std::process::Output> {
        // No SIGINT equivalent for detached children; ask politely via taskkill without /F.
        std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .output()
    }

    fn kill_process(pid: u32) -> std::io::Result<std::process::Output> {
        std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .output()
    }

    fn restrict_dir_permissions(_path: &Path) {
        // Windows uses ACLs; no simple equivalent to Unix mode bits.
    }

    fn restrict_file_permissions(_path: &Path) {
        // Windows uses ACLs; no simple equivalent to Unix mode bits.
    }

    fn data_dir() -> PathBuf {
        resolve_data_dir(
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("agentbox"),
        )
    }
}
