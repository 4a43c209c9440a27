use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

/// Capacity of the in-memory log fan-out behind `GET /debug/logs`.
pub(crate) const LOG_CHANNEL_CAPACITY: usize = 500;

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
        let line = String::from_utf8_lossy(buf).to_string();
        let _ = self.sender.send(line); // no subscribers is fine
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

fn parse_level(value: &str) -> Level {
    Level::from_str(value.trim()).unwrap_or(Level::INFO)
}

/// Install the global subscriber and return the sender that feeds the log stream.
pub(crate) fn init_logging(level: &str) -> broadcast::Sender<String> {
    let (log_tx, _) = broadcast::channel::<String>(LOG_CHANNEL_CAPACITY);
    let make_writer = SseMakeWriter {
        sender: log_tx.clone(),
        suppress_stdout: false,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .with_writer(make_writer)
        .finish();
    // Already set when embedded in a test binary.
    tracing::subscriber::set_global_default(subscriber).ok();

    log_tx
}
