mod daemon;
mod serve;

use anyhow::{Result, bail};
use console::style;
use std::path::PathBuf;

use crate::core::terminal::{self, GuideSection, print_error};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Server")
        .command("serve", "Run the hub in the foreground")
        .command("start", "Start the hub as a background daemon")
        .command("stop", "Stop the background daemon")
        .command("status", "Show whether the daemon is running")
        .print();

    GuideSection::new("Options")
        .command("--host <addr>", "Bind address (default 127.0.0.1)")
        .command("--port <port>", "API port (default 17900)")
        .command("--config <file>", "Config file (default <data_dir>/config.toml)")
        .command("--log-level <level>", "trace, debug, info, warn or error")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("agentbox").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ServeArgs {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
    pub log_level: Option<String>,
}

pub(crate) fn parse_serve_flags(args: &[String], start: usize) -> Result<ServeArgs> {
    let mut parsed = ServeArgs::default();
    let mut i = start;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = args.get(i + 1).cloned();
        match (flag, value) {
            ("--host", Some(v)) => parsed.host = Some(v),
            ("--port", Some(v)) => match v.parse() {
                Ok(port) => parsed.port = Some(port),
                Err(_) => bail!("invalid --port value '{}'", v),
            },
            ("--config", Some(v)) => parsed.config = Some(PathBuf::from(v)),
            ("--log-level", Some(v)) => parsed.log_level = Some(v),
            ("--host" | "--port" | "--config" | "--log-level", None) => {
                bail!("{} needs a value", flag)
            }
            _ => bail!("unknown option '{}'", flag),
        }
        i += 2;
    }
    Ok(parsed)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };

    match cmd {
        "serve" => {
            let parsed = parse_serve_flags(&args, 2)?;
            serve::run_server(parsed, true).await
        }
        "daemon-run" => {
            let parsed = parse_serve_flags(&args, 2)?;
            serve::run_server(parsed, false).await
        }
        "start" => {
            let parsed = parse_serve_flags(&args, 2)?;
            daemon::daemon_start(&parsed, &args[2..]).await
        }
        "stop" => daemon::daemon_stop(&parse_serve_flags(&args, 2)?).await,
        "status" => daemon::daemon_status(&parse_serve_flags(&args, 2)?).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}
