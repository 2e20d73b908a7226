//! Decoupled logging pipeline for build runs.
//!
//! ```text
//! log::info!() / warn!() / error!()
//!     |
//! [LogCollector] (non-blocking, crossbeam unbounded channel)
//!     |
//! [disk writer thread] -> <log_dir>/skyimager_<ts>.log (every line)
//!                      -> stderr (lines at or above the mirror level)
//! ```
//!
//! Lines are never dropped: the channel is unbounded and the writer thread is
//! a plain OS thread, independent of any tokio runtime.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Internal log line or special marker
enum LogMessage {
    Line(LogLine),
    /// Flush marker with channel sender to signal completion
    Flush(std::sync::mpsc::Sender<()>),
}

/// Default log directory: `<data dir>/skyimager/logs`, or `./logs`.
pub fn get_global_logs_path() -> Result<PathBuf, String> {
    if let Some(data) = dirs::data_local_dir() {
        return Ok(data.join("skyimager").join("logs"));
    }
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Failed to get current working directory: {}", e))?;
    Ok(cwd.join("logs"))
}

pub fn ensure_logs_dir_exists(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("Failed to create logs directory: {}", e))
}

/// A log line with metadata
#[derive(Clone, Debug)]
pub struct LogLine {
    pub message: String,
    pub level: log::Level,
    /// `HH:MM:SS.mmm`, local time
    pub timestamp: String,
}

impl LogLine {
    pub fn new(level: log::Level, message: String) -> Self {
        LogLine {
            message,
            level,
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
        }
    }

    fn format(&self) -> String {
        format!("[{}] [{}] {}\n", self.timestamp, self.level, self.message)
    }
}

/// Logger writing every line to a session file and mirroring to stderr.
#[derive(Clone)]
pub struct LogCollector {
    tx: Sender<LogMessage>,
    log_path: PathBuf,
    /// Most verbose level accepted at all
    max_level: LevelFilter,
}

impl LogCollector {
    /// Create the session file and start the writer thread.
    ///
    /// `mirror_level` selects which lines also go to stderr; `Off` disables mirroring.
    pub fn new(
        log_dir: PathBuf,
        max_level: LevelFilter,
        mirror_level: LevelFilter,
    ) -> Result<Self, String> {
        ensure_logs_dir_exists(&log_dir)?;

        let log_path = log_dir.join(format!(
            "skyimager_{}.log",
            Local::now().format("%Y%m%d_%H%M%S")
        ));
        let mut file: File = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| format!("Failed to create log file {}: {}", log_path.display(), e))?;

        let (tx, rx) = unbounded::<LogMessage>();

        std::thread::spawn(move || {
            while let Ok(msg) = rx.recv() {
                match msg {
                    LogMessage::Line(line) => {
                        let formatted = line.format();
                        let _ = file.write_all(formatted.as_bytes());
                        if line.level <= mirror_level {
                            eprint!("{}", formatted);
                        }
                    }
                    LogMessage::Flush(done) => {
                        let _ = file.flush();
                        let _ = file.sync_data();
                        let _ = done.send(());
                    }
                }
            }
        });

        Ok(LogCollector {
            tx,
            log_path,
            max_level,
        })
    }

    /// Install a clone as the global `log` backend.
    pub fn install(&self) -> Result<(), String> {
        log::set_boxed_logger(Box::new(self.clone()))
            .map_err(|e| format!("Failed to install logger: {}", e))?;
        log::set_max_level(self.max_level);
        Ok(())
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Send a log line (non-blocking)
    pub fn log_line(&self, line: LogLine) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    pub fn log_str(&self, message: impl Into<String>) {
        self.log_line(LogLine::new(log::Level::Info, message.into()));
    }

    /// Block until every line sent before this call is on disk.
    pub fn flush_blocking(&self) -> Result<(), String> {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        self.tx
            .send(LogMessage::Flush(tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        rx.recv()
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }

    /// Async wrapper over [`flush_blocking`](Self::flush_blocking).
    pub async fn wait_for_empty(&self) -> Result<(), String> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.flush_blocking())
            .await
            .map_err(|e| format!("Flush task failed: {}", e))?
    }
}

/// Wires all log::info!(), log::warn!(), log::error!() calls into LogCollector
impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.log_line(LogLine::new(record.level(), record.args().to_string()));
        }
    }

    fn flush(&self) {
        let _ = self.flush_blocking();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_log_collector_creates_session_file() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("logs");
        let collector = LogCollector::new(dir.clone(), LevelFilter::Debug, LevelFilter::Off).unwrap();

        assert!(dir.exists());
        assert!(collector.log_path().starts_with(&dir));
        let name = collector.log_path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("skyimager_") && name.ends_with(".log"));
    }

    #[tokio::test]
    async fn test_lines_reach_disk_after_flush() {
        let tmp = TempDir::new().unwrap();
        let collector =
            LogCollector::new(tmp.path().to_path_buf(), LevelFilter::Debug, LevelFilter::Off).unwrap();

        for i in 0..500 {
            collector.log_str(format!("[Test] line {}", i));
        }
        collector.wait_for_empty().await.unwrap();

        let content = fs::read_to_string(collector.log_path()).unwrap();
        assert_eq!(content.lines().count(), 500);
        assert!(content.contains("[INFO] [Test] line 499"));
    }

    #[test]
    fn test_level_filter() {
        let tmp = TempDir::new().unwrap();
        let collector =
            LogCollector::new(tmp.path().to_path_buf(), LevelFilter::Info, LevelFilter::Off).unwrap();

        let debug = Metadata::builder().level(log::Level::Debug).build();
        let warn = Metadata::builder().level(log::Level::Warn).build();
        assert!(!collector.enabled(&debug));
        assert!(collector.enabled(&warn));
    }
}
