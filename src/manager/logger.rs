//! The manager's log sink.
//!
//! Records submitted by instances end up here, one line per record, and
//! are re-emitted as tracing events so they also show up on the
//! manager's console.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::logging::{LogLevel, LogMessage};

pub struct Logger {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl Logger {
    /// A logger writing to the given file, truncating it.
    pub fn to_file(path: &Path) -> Result<Logger> {
        let file = File::create(path)?;
        Ok(Logger::to_writer(Box::new(BufWriter::new(file))))
    }

    /// A logger writing to an arbitrary sink.
    pub fn to_writer(writer: Box<dyn Write + Send>) -> Logger {
        Logger { sink: Mutex::new(writer) }
    }

    /// Appends one record and flushes, so that the sink is complete even
    /// if the manager dies right after.
    pub fn log(&self, record: &LogMessage) {
        let line = format!(
            "{} {:8} {} ({}): {}",
            record.timestamp.to_rfc3339(),
            record.level.as_str(),
            record.instance_id,
            record.operator.as_str(),
            record.text,
        );

        {
            let mut sink = self.sink.lock().expect("log sink lock poisoned");
            if writeln!(sink, "{}", line).and_then(|_| sink.flush()).is_err() {
                error!("failed to write to the manager log sink");
            }
        }

        match record.level {
            LogLevel::Debug => debug!("{}", line),
            LogLevel::Info => info!("{}", line),
            LogLevel::Warning => warn!("{}", line),
            LogLevel::Error | LogLevel::Critical => error!("{}", line),
        }
    }
}
