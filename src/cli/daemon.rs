use anyhow::Result;
use console::style;
use std::path::{Path, PathBuf};

use super::ServeArgs;
use super::serve::resolve_config;
use crate::core::terminal::{GuideSection, print_info, print_warn};
use crate::platform::{NativePlatform, Platform};

pub(crate) struct DaemonPaths {
    pub run_dir: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl DaemonPaths {
    pub fn new(data_dir: &Path) -> Self {
        let run_dir = data_dir.join("run");
        Self {
            pid_file: run_dir.join("agentbox.pid"),
            log_file: run_dir.join("agentbox.log"),
            run_dir,
        }
    }

    fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
    }
}

/// Re-run this binary as `daemon-run` in the background, logging to
/// `<data_dir>/run/agentbox.log`.
pub async fn daemon_start(args: &ServeArgs, forwarded: &[String]) -> Result<()> {
    let config = resolve_config(args)?;
    let paths = DaemonPaths::new(&config.data_dir);
    std::fs::create_dir_all(&paths.run_dir)?;
    NativePlatform::restrict_dir_permissions(&paths.run_dir);
    if paths.read_pid().is_some() {
        print_warn("Daemon is already running. Use 'agentbox stop' first.");
        return Ok(());
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)?;
    NativePlatform::restrict_file_permissions(&paths.log_file);

    let exe = std::env::current_exe()?;
    let child = std::process::Command::new(exe)
        .arg("daemon-run")
        .args(forwarded)
        .stdin(std::process::Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()?;

    std::fs::write(&paths.pid_file, child.id().to_string())?;

    GuideSection::new("Daemon Started")
        .status(
            "Status",
            &format!(
                "{} (PID {})",
                style("RUNNING").green().bold(),
                style(child.id()).dim()
            ),
        )
        .link("API", &format!("http://{}:{}", config.host, config.port))
        .status("Log", &paths.log_file.display().to_string())
        .print();
    println!();

    Ok(())
}

/// SIGTERM the daemon; it flags active sessions before exiting.
pub async fn daemon_stop(args: &ServeArgs) -> Result<()> {
    let config = resolve_config(args)?;
    let paths = DaemonPaths::new(&config.data_dir);

    match paths.read_pid() {
        Some(pid) => {
            let _ = NativePlatform::kill_process(pid);
            GuideSection::new("Daemon Stopped")
                .status(
                    "Status",
                    &format!(
                        "{} (was PID {})",
                        style("STOPPED").red().bold(),
                        style(pid).dim()
                    ),
                )
                .print();
        }
        None => print_info("Daemon is not currently running."),
    }
    std::fs::remove_file(&paths.pid_file).ok();

    println!();
    Ok(())
}

pub async fn daemon_status(args: &ServeArgs) -> Result<()> {
    let config = resolve_config(args)?;
    let paths = DaemonPaths::new(&config.data_dir);

    if let Some(pid) = paths.read_pid() {
        GuideSection::new("Daemon Status")
            .status(
                "Daemon",
                &format!(
                    "{} (PID {})",
                    style("RUNNING").green().bold(),
                    style(pid).dim()
                ),
            )
            .link("API", &format!("http://{}:{}", config.host, config.port))
            .print();
    } else {
        GuideSection::new("Daemon Status")
            .status("Daemon", &style("STOPPED").red().bold().to_string())
            .blank()
            .info(&format!(
                "Run {} to start it.",
                style("agentbox start").cyan().bold()
            ))
            .print();
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_lives_under_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::new(dir.path());
        assert_eq!(paths.pid_file, dir.path().join("run").join("agentbox.pid"));
        assert_eq!(paths.read_pid(), None);

        std::fs::create_dir_all(&paths.run_dir).unwrap();
        std::fs::write(&paths.pid_file, "4242\n").unwrap();
        assert_eq!(paths.read_pid(), Some(4242));

        std::fs::write(&paths.pid_file, "garbage").unwrap();
        assert_eq!(paths.read_pid(), None);
    }
}
