use tokio::sync::broadcast;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

/// Lines kept for slow `/api/logs` subscribers before they see a lag notice.
const LOG_CHANNEL_CAPACITY: usize = 500;

/// Writes every formatted log line to stdout and to a broadcast channel
/// that backs the SSE log stream.
#[derive(Clone)]
pub(crate) struct SseMakeWriter {
    pub sender: broadcast::Sender<String>,
    pub suppress_stdout: bool,
}

impl<'a> MakeWriter<'a> for SseMakeWriter {
    type Writer = SseWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SseWriter {
            sender: self.sender.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub(crate) struct SseWriter {
    sender: broadcast::Sender<String>,
    suppress_stdout: bool,
}

impl std::io::Write for SseWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let line = String::from_utf8_lossy(buf).trim_end().to_string();
        if !line.is_empty() {
            let _ = self.sender.send(line); // no subscribers is fine
        }
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

/// `--log-level` value; anything unrecognised falls back to info.
pub(crate) fn parse_level(raw: &str) -> Level {
    raw.trim().parse().unwrap_or(Level::INFO)
}

/// Install the global subscriber and return the sender feeding `/api/logs`.
pub(crate) fn init(level: Level) -> broadcast::Sender<String> {
    let (log_tx, _) = broadcast::channel::<String>(LOG_CHANNEL_CAPACITY);
    let make_writer = SseMakeWriter {
        sender: log_tx.clone(),
        suppress_stdout: false,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok(); // already set in tests
    log_tx
}
