use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::{Platform, resolve_data_dir};

pub struct NativePlatform;

impl Platform for NativePlatform {
    fn interrupt_process(pid: u32) -> std::io::Result<std::process::Output> {
        std::process::Command::new("kill")
            .arg("-INT")
            .arg(pid.to_string())
            .output()
    }

    fn kill_process(pid: u32) -> std::io::Result<std::process::Output> {
        std::process::Command::new("kill")
            .arg("-15")
            .arg(pid.to_string())
            .output()
    }

    fn restrict_dir_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
    }

    fn restrict_file_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }

    fn data_dir() -> PathBuf {
        resolve_data_dir(
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".agentbox"),
        )
    }
}
