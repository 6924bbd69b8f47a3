use anyhow::{Context, Result};
use console::style;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::ServeArgs;
use crate::core::agent::CommandBackend;
use crate::core::config::HubConfig;
use crate::core::hub::Hub;
use crate::core::terminal::{self, GuideSection};
use crate::interfaces::web::ApiServer;
use crate::logging;
use crate::platform::{NativePlatform, Platform};

/// Extra time granted past the drain timeout before the watchdog exits.
const WATCHDOG_GRACE: Duration = Duration::from_secs(5);

/// Config file plus command-line overrides.
pub(crate) fn resolve_config(args: &ServeArgs) -> Result<HubConfig> {
    let mut config = HubConfig::load(args.config.as_deref())?;
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    Ok(config)
}

/// Run the hub in the foreground until Ctrl+C or SIGTERM.
pub async fn run_server(args: ServeArgs, show_guide: bool) -> Result<()> {
    let config = resolve_config(&args)?;
    let log_tx = logging::init(logging::parse_level(
        args.log_level.as_deref().unwrap_or("info"),
    ));

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    NativePlatform::restrict_dir_permissions(&config.data_dir);
    std::fs::create_dir_all(config.working_dir())
        .with_context(|| format!("creating {}", config.working_dir().display()))?;

    info!("Starting agentbox on {}:{}", config.host, config.port);
    let backend = Arc::new(CommandBackend::new(config.backend.clone()));
    let hub = Hub::open(config.clone(), backend).await?;

    let mut lifecycle = hub.lifecycle();
    lifecycle.attach(Arc::new(ApiServer::new(hub.clone(), log_tx)));
    lifecycle.start().await?;

    if show_guide {
        print_guide(&config);
    }

    shutdown_signal().await;
    info!("Shutdown requested");

    // Force an exit if cleanup hangs past the drain timeout.
    let deadline = config.shutdown_timeout() + WATCHDOG_GRACE;
    std::thread::spawn(move || {
        std::thread::sleep(deadline);
        eprintln!("agentbox: cleanup exceeded {:?}; forcing exit", deadline);
        std::process::exit(1);
    });

    if let Err(e) = lifecycle.shutdown().await {
        error!("Shutdown error: {}", e);
    }
    if !hub.drain().await {
        warn!("Exiting with executions still running");
    }
    info!("agentbox stopped");
    if show_guide {
        terminal::print_goodbye();
    }
    Ok(())
}

fn print_guide(config: &HubConfig) {
    let url = format!("http://{}:{}", config.host, config.port);
    let mut guide = GuideSection::new("agentbox")
        .link("API", &url)
        .link("Listeners", &format!("ws://{}:{}/ws", config.host, config.port))
        .status("Data", &config.data_dir.display().to_string())
        .status("Backend", &config.backend.program);
    if config.api_token.is_none() && !config.is_loopback() {
        guide = guide
            .blank()
            .warn("No api_token configured; the API refuses requests on this host.");
    }
    guide
        .blank()
        .text(&format!(
            "Press {} to stop.",
            style("Ctrl+C").bold().yellow()
        ))
        .print();
    println!();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "host = '0.0.0.0'\nport = 18000\n").unwrap();

        let args = ServeArgs {
            config: Some(path.clone()),
            port: Some(19000),
            ..ServeArgs::default()
        };
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 19000);

        let args = ServeArgs {
            config: Some(path),
            host: Some("127.0.0.1".into()),
            ..ServeArgs::default()
        };
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 18000);
    }
}
