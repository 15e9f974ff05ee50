use log::{Level, Metadata, Record, SetLoggerError};
use serde::Serialize;
use std::sync::OnceLock;
use chrono::Local;
use tokio::sync::mpsc;

static LOGGER: OnceLock<EventLogger> = OnceLock::new();

#[derive(Debug, Serialize, Clone)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// `log` backend that prints to stderr and forwards every record to a
/// channel, so a front end can show the log next to the device state.
pub struct EventLogger {
    sender: mpsc::UnboundedSender<LogMessage>,
    level: Level,
}

impl EventLogger {
    pub fn new(sender: mpsc::UnboundedSender<LogMessage>, level: Level) -> Self {
        Self { sender, level }
    }

    /// Installs the global logger and returns the receiving end of its channel.
    /// Fails if a logger is already installed.
    pub fn init(level: Level) -> Result<mpsc::UnboundedReceiver<LogMessage>, SetLoggerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let logger = LOGGER.get_or_init(|| EventLogger::new(sender, level));
        log::set_logger(logger).map(|()| log::set_max_level(level.to_level_filter()))?;
        Ok(receiver)
    }

    fn emit_log(&self, record: &Record) {
        let log_message = LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };

        // nobody listening is fine
        let _ = self.sender.send(log_message);
    }
}

impl log::Log for EventLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
            self.emit_log(record);
        }
    }

    fn flush(&self) {}
}
