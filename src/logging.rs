//! Log file output
//!
//! Every event is appended to the log file as one line:
//!
//! ```text
//! [2024-05-01 12:00:00] [RELAY]	INFO  -- Accepted SOCKS5 client 127.0.0.1:50000 as conn0
//! ```
//!
//! The bracketed module is the first path segment below the crate root, so
//! all of `uns_gateway::device::*` logs as `DEVICE`.

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Minimum severity written to the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(into = "String")]
pub enum LogLevel {
    /// Everything, including per-frame traces
    Debug,
    /// Normal operation
    #[default]
    Info,
    /// Recoverable problems
    Warn,
    /// Failures only
    Error,
}

impl LogLevel {
    /// Matching `tracing` level
    pub fn as_tracing(self) -> Level {
        match self {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    fn from_number(value: i64) -> Option<Self> {
        match value {
            0 => Some(LogLevel::Debug),
            1 => Some(LogLevel::Info),
            2 => Some(LogLevel::Warn),
            3 => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    /// Accepts a level name or its number, `0` (debug) to `3` (error)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(number) = s.parse::<i64>() {
            return Self::from_number(number)
                .ok_or_else(|| format!("log level number must be 0-3, got {}", number));
        }
        match s.to_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level {:?}", other)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.to_string()
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => LogLevel::from_number(n).ok_or_else(|| {
                serde::de::Error::custom(format!("log level number must be 0-3, got {}", n))
            }),
            Raw::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Module tag for a tracing target
fn module_of(target: &str) -> String {
    let mut parts = target.split("::");
    let first = parts.next().unwrap_or_default();
    parts.next().unwrap_or(first).to_uppercase()
}

/// Render one log line, newline included
pub fn format_line(timestamp: &str, target: &str, level: &Level, message: &str) -> String {
    format!(
        "[{}] [{}]\t{:<5} -- {}\n",
        timestamp,
        module_of(target),
        level.as_str(),
        message
    )
}

#[derive(Default)]
struct LineVisitor {
    message: String,
}

impl tracing::field::Visit for LineVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message.insert_str(0, value);
        } else {
            self.message.push_str(&format!(" {}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message.insert_str(0, &format!("{:?}", value));
        } else {
            self.message.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

/// Layer appending formatted lines to a writer
pub struct FileLayer<W> {
    writer: Mutex<W>,
}

impl<W: Write> FileLayer<W> {
    /// Wrap a writer
    pub fn new(writer: W) -> Self {
        FileLayer {
            writer: Mutex::new(writer),
        }
    }
}

impl<S, W> tracing_subscriber::Layer<S> for FileLayer<W>
where
    S: tracing::Subscriber,
    W: Write + Send + 'static,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let line = format_line(&timestamp, metadata.target(), metadata.level(), &visitor.message);
        if let Ok(mut writer) = self.writer.lock() {
            // Nowhere left to report a failed log write.
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.flush();
        }
    }
}

fn open_log(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {:?}", path))
}

/// Install the global subscriber writing to `path`
pub fn init_logging(path: &Path, level: LogLevel) -> Result<()> {
    let file = open_log(path)?;
    let filter = EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), level))
        .add_directive("tokio=warn".parse().context("Invalid log directive")?);

    tracing_subscriber::registry()
        .with(filter)
        .with(FileLayer::new(file))
        .try_init()
        .context("Logging already initialized")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_level_names_and_numbers() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("0".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("3".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("4".parse::<LogLevel>().is_err());
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_level_ordering_and_display() {
        assert!(LogLevel::Debug < LogLevel::Error);
        assert_eq!(LogLevel::Warn.to_string(), "warn");
        assert_eq!(LogLevel::Info.as_tracing(), Level::INFO);
    }

    #[test]
    fn test_format_line() {
        let line = format_line(
            "2024-05-01 12:00:00",
            "uns_gateway::device::aquasent",
            &Level::WARN,
            "handshake timed out",
        );
        assert_eq!(
            line,
            "[2024-05-01 12:00:00] [DEVICE]\tWARN  -- handshake timed out\n"
        );
        assert!(format_line("t", "uns_gateway", &Level::INFO, "m").contains("[UNS_GATEWAY]"));
    }

    #[test]
    fn test_file_layer_writes_lines() {
        let sink = Shared::default();
        let subscriber = tracing_subscriber::registry().with(FileLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(bytes = 3, "Read frame");
        });

        let text = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(text.ends_with("INFO  -- Read frame bytes=3\n"), "{}", text);
        assert!(text.starts_with('['));
    }

    #[test]
    fn test_open_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uns.log");
        std::fs::write(&path, "old\n").unwrap();
        let mut file = open_log(&path).unwrap();
        file.write_all(b"new\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old\nnew\n");
    }
}
