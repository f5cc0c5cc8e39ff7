use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use log::{LevelFilter, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

// File logger for the terminal host. The TUI owns stdout, so log lines go to
// a file when one is configured and are dropped otherwise.

pub struct SimpleLogger {
    log_file: Option<Mutex<File>>,
}

impl SimpleLogger {
    pub fn new(log_file_path: Option<&Path>) -> Result<Self> {
        let log_file = match log_file_path {
            Some(path) => Some(Mutex::new(OpenOptions::new().create(true).append(true).open(path)?)),
            None => None,
        };

        Ok(SimpleLogger { log_file })
    }
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let file = match &self.log_file {
            Some(file) => file,
            None => return,
        };

        let now: DateTime<Local> = Local::now();
        let log_message = format!(
            "[{}] {} [{}:{}] {}\n",
            now.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        );

        if let Ok(mut file) = file.lock() {
            let _ = file.write_all(log_message.as_bytes());
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.log_file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

pub fn parse_level(level: &str) -> Result<LevelFilter> {
    level
        .parse::<LevelFilter>()
        .map_err(|_| anyhow!("Unknown log level {:?}", level))
}

pub fn setup_logging(log_file: Option<&Path>, level: LevelFilter) -> Result<()> {
    let logger = SimpleLogger::new(log_file)?;
    log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;

    log::info!("Logging initialized at level: {}", level);
    log::info!("{} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    Ok(())
}
