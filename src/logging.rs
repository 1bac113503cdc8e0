//! Logging support.
//!
//! Instances log locally through `tracing` into their own log file and
//! forward records at warning level and above to the manager, which
//! appends them to a central sink. The wire form of a record is
//! [`LogMessage`]; timestamps travel as RFC3339 UTC strings with
//! millisecond precision.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use colored::Colorize;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};
use crate::model::Operator;
use crate::reference::Reference;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "DEBUG")]
    Debug,
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    /// The closest `tracing` level; CRITICAL maps to ERROR.
    pub fn tracing_level(self) -> Level {
        match self {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warning => Level::WARN,
            LogLevel::Error | LogLevel::Critical => Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A UTC timestamp that serializes as RFC3339 with millisecond
/// precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Timestamp {
        Timestamp(Utc::now())
    }

    pub fn from_rfc3339(text: &str) -> Result<Timestamp> {
        let parsed = DateTime::parse_from_rfc3339(text)
            .map_err(|e| Error::Protocol(format!("invalid timestamp '{}': {}", text, e)))?;
        Ok(Timestamp(parsed.with_timezone(&Utc)))
    }

    pub fn to_rfc3339(self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Timestamp::from_rfc3339(&text).map_err(D::Error::custom)
    }
}

/// A log record as submitted to the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Name of the instance that produced the record.
    pub instance_id: Reference,
    /// The operator the instance was executing, or NONE outside the
    /// reuse loop.
    pub operator: Operator,
    pub timestamp: Timestamp,
    pub level: LogLevel,
    pub text: String,
}

/// Resolves the log file path for an instance.
///
/// With no explicit path the file goes into the current directory under
/// the default name; an explicit directory gets the default name
/// appended; anything else is used as given.
pub fn instance_log_file(instance: &Reference, given: Option<PathBuf>) -> PathBuf {
    let filename = format!("muscle3.{}.log", instance);
    match given {
        None => PathBuf::from(".").join(filename),
        Some(path) if path.is_dir() => path.join(filename),
        Some(path) => path,
    }
}

/// Installs a file writer for this process's tracing output.
///
/// Returns the appender guard, which must be kept alive for the log
/// file to be flushed. When a subscriber is already installed (several
/// instances in one test process, say) this is a no-op.
pub fn init_instance_logging(path: &Path) -> Option<WorkerGuard> {
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let filename = path.file_name().unwrap_or_else(|| "muscle3.log".as_ref());
    let appender = tracing_appender::rolling::never(directory, filename);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter);

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Some(guard),
        Err(_) => None,
    }
}

/// Event formatter that colors each console line by severity.
///
/// Used for the manager's stdout output, where the full metadata of the
/// file log would be noise.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the fields so the whole line can be colored at once.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::ERROR => buffer.red(),
            Level::WARN => buffer.yellow(),
            Level::INFO => buffer.white(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}
