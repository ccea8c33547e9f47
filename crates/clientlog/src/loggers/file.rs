// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! File backend: Bunyan JSON lines or human-readable text lines.
//!
//! Writes, rotation and backup compression are blocking file I/O and run on
//! tokio's blocking pool, never on the async workers shared with other
//! destinations.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::{FileFormat, FileSettings};
use crate::enrich::{LogRecord, FIELD_LEVEL, FIELD_MSG, FIELD_TIME};
use crate::errors::LoggerError;
use crate::loggers::rotate::RotatingWriter;
use crate::loggers::{level_name, Logger};

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;

/// Fields kept when a line has to be replaced, with their byte budgets.
const ESSENTIAL_FIELDS: &[(&str, usize)] = &[
    ("time", 64),
    ("level", 16),
    ("hostname", 256),
    ("pid", 16),
    ("name", 128),
    ("site_id", 128),
    ("client_ip", 64),
    ("ip_address", 64),
    ("user_agent", 512),
    ("x_forwarded_for", 256),
];

#[derive(Debug)]
enum FileWriter {
    Plain(File),
    Rotating(RotatingWriter),
}

impl FileWriter {
    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        match self {
            FileWriter::Plain(file) => file.write_all(&buf),
            FileWriter::Rotating(writer) => writer.write_all(&buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            FileWriter::Plain(file) => file.flush(),
            FileWriter::Rotating(writer) => writer.flush(),
        }
    }
}

#[derive(Debug)]
pub struct FileLogger {
    name: String,
    format: FileFormat,
    max_message_size: usize,
    writer: Arc<Mutex<Option<FileWriter>>>,
}

impl FileLogger {
    /// Opens the destination file, rotating when any rotation limit is set.
    ///
    /// # Errors
    ///
    /// Fails when the file or its parent directory cannot be created.
    pub fn open(
        name: &str,
        settings: &FileSettings,
        max_message_size: usize,
    ) -> Result<Self, LoggerError> {
        let path = Path::new(&settings.path);
        let writer = if settings.rotation.is_enabled() {
            FileWriter::Rotating(RotatingWriter::open(path, &settings.rotation)?)
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            FileWriter::Plain(OpenOptions::new().create(true).append(true).open(path)?)
        };

        debug!(destination = %name, path = %settings.path, "opened log file");
        Ok(FileLogger {
            name: name.to_string(),
            format: settings.format,
            max_message_size: if max_message_size == 0 {
                DEFAULT_MAX_MESSAGE_SIZE
            } else {
                max_message_size
            },
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    fn render(&self, record: &LogRecord) -> Result<String, LoggerError> {
        match self.format {
            FileFormat::Json => Ok(serde_json::to_string(record)?),
            FileFormat::Text => Ok(text_line(record)),
        }
    }

    /// Renders `record`, replacing it with a minimal record when too large.
    fn format_line(&self, record: &LogRecord) -> Result<String, LoggerError> {
        let line = self.render(record)?;
        if line.len() <= self.max_message_size {
            return Ok(line);
        }

        let minimal = minimal_record(record, line.len(), self.max_message_size);
        let line = self.render(&minimal)?;
        if line.len() <= self.max_message_size {
            return Ok(line);
        }

        let message = truncation_error(line.len(), self.max_message_size);
        Ok(cut_to_bytes(&message, self.max_message_size).to_string())
    }
}

#[async_trait]
impl Logger for FileLogger {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    async fn log(&self, record: LogRecord) -> Result<(), LoggerError> {
        let line = self.format_line(&record)?;
        let writer = Arc::clone(&self.writer);
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || -> Result<(), LoggerError> {
            let mut guard = writer
                .lock()
                .map_err(|_| LoggerError::LockPoisoned(name.clone()))?;
            let writer = guard.as_mut().ok_or(LoggerError::Closed(name))?;
            writer.write_line(&line)?;
            Ok(())
        })
        .await?
    }

    async fn close(&self) -> Result<(), LoggerError> {
        let writer = Arc::clone(&self.writer);
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || -> Result<(), LoggerError> {
            let mut guard = writer.lock().map_err(|_| LoggerError::LockPoisoned(name))?;
            if let Some(mut writer) = guard.take() {
                writer.flush()?;
            }
            Ok(())
        })
        .await?
    }
}

/// `[time] LEVEL: msg key=value ...` with the remaining keys sorted.
#[must_use]
pub fn text_line(record: &LogRecord) -> String {
    let time = record
        .get(FIELD_TIME)
        .map(plain_value)
        .unwrap_or_default();
    let msg = record.get(FIELD_MSG).map(plain_value).unwrap_or_default();
    let mut line = format!("[{time}] {}: {msg}", level_name(record.get(FIELD_LEVEL)));

    let mut keys: Vec<&String> = record
        .keys()
        .filter(|k| !matches!(k.as_str(), FIELD_TIME | FIELD_LEVEL | FIELD_MSG))
        .collect();
    keys.sort();
    for key in keys {
        line.push(' ');
        line.push_str(key);
        line.push('=');
        line.push_str(&plain_value(&record[key.as_str()]));
    }
    line
}

/// Strings without quotes, everything else as JSON.
fn plain_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncation_error(size: usize, limit: usize) -> String {
    format!("log message truncated: {size} bytes exceeds the {limit} byte limit")
}

fn minimal_record(record: &LogRecord, size: usize, limit: usize) -> LogRecord {
    let mut minimal = LogRecord::new();
    if let Some(v) = record.get("v") {
        minimal.insert("v".to_string(), v.clone());
    }
    for (field, budget) in ESSENTIAL_FIELDS {
        match record.get(*field) {
            Some(Value::String(s)) => {
                minimal.insert(
                    (*field).to_string(),
                    Value::from(cut_to_bytes(s, *budget)),
                );
            }
            Some(value @ (Value::Number(_) | Value::Bool(_))) => {
                if value.to_string().len() <= *budget {
                    minimal.insert((*field).to_string(), value.clone());
                }
            }
            _ => {}
        }
    }
    minimal.insert("error".to_string(), Value::from(truncation_error(size, limit)));
    minimal
}

/// Longest prefix of `s` that is at most `max` bytes and ends on a char
/// boundary.
fn cut_to_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RotationSettings;
    use serde_json::json;

    fn record(value: Value) -> LogRecord {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn settings(path: &Path, format: FileFormat) -> FileSettings {
        FileSettings {
            path: path.to_string_lossy().into_owned(),
            format,
            rotation: RotationSettings::default(),
        }
    }

    fn sample() -> LogRecord {
        record(json!({
            "v": 0,
            "name": "clientlog",
            "hostname": "web-1",
            "pid": 7,
            "level": 30,
            "time": "2024-05-01T12:30:45.000000001Z",
            "msg": "checkout started",
            "site_id": "s1",
            "cart": {"items": 2},
        }))
    }

    #[tokio::test]
    async fn test_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let logger = FileLogger::open("local", &settings(&path, FileFormat::Json), 0).unwrap();

        logger.log(sample()).await.unwrap();
        logger.log(sample()).await.unwrap();
        logger.close().await.unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["v"], 0);
            assert_eq!(parsed["cart"]["items"], 2);
        }
    }

    #[tokio::test]
    async fn test_text_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/events.txt");
        let logger = FileLogger::open("local", &settings(&path, FileFormat::Text), 0).unwrap();

        logger.log(sample()).await.unwrap();
        logger.close().await.unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "[2024-05-01T12:30:45.000000001Z] INFO: checkout started cart={\"items\":2} hostname=web-1 name=clientlog pid=7 site_id=s1 v=0\n"
        );
    }

    #[tokio::test]
    async fn test_oversized_line_becomes_minimal_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let logger = FileLogger::open("local", &settings(&path, FileFormat::Json), 512).unwrap();

        let mut big = sample();
        big.insert("payload".to_string(), Value::from("x".repeat(2000)));
        big.insert("user_agent".to_string(), Value::from("u".repeat(200)));
        logger.log(big).await.unwrap();
        logger.close().await.unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let line = contents.trim_end();
        assert!(line.len() <= 512);
        let parsed: Value = serde_json::from_str(line).unwrap();
        assert_eq!(parsed["v"], 0);
        assert_eq!(parsed["site_id"], "s1");
        assert_eq!(parsed["user_agent"].as_str().unwrap().len(), 200);
        assert!(parsed.get("payload").is_none());
        assert!(parsed.get("msg").is_none());
        assert!(parsed["error"].as_str().unwrap().starts_with("log message truncated"));
    }

    #[tokio::test]
    async fn test_tiny_limit_falls_back_to_error_string() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let logger = FileLogger::open("local", &settings(&path, FileFormat::Json), 20).unwrap();

        logger.log(sample()).await.unwrap();
        logger.close().await.unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "log message truncate\n");
    }

    #[tokio::test]
    async fn test_log_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let logger = FileLogger::open("local", &settings(&path, FileFormat::Json), 0).unwrap();
        logger.close().await.unwrap();
        assert!(matches!(
            logger.log(sample()).await,
            Err(LoggerError::Closed(_))
        ));
        logger.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rotating_writer_selected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let mut file_settings = settings(&path, FileFormat::Json);
        file_settings.rotation.max_backups = 1;
        let logger = FileLogger::open("local", &file_settings, 0).unwrap();
        assert!(matches!(
            *logger.writer.lock().unwrap(),
            Some(FileWriter::Rotating(_))
        ));
        assert_eq!(logger.max_message_size(), DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[tokio::test]
    async fn test_held_writer_does_not_stall_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let logger =
            Arc::new(FileLogger::open("local", &settings(&path, FileFormat::Json), 0).unwrap());

        // Keep the writer busy from a plain thread, as a long rotation would.
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let writer = Arc::clone(&logger.writer);
        let holder = std::thread::spawn(move || {
            let _guard = writer.lock().unwrap();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        locked_rx.recv().unwrap();

        let pending = tokio::spawn({
            let logger = Arc::clone(&logger);
            async move { logger.log(sample()).await }
        });
        // The single-threaded test runtime still makes progress.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        release_tx.send(()).unwrap();
        pending.await.unwrap().unwrap();
        holder.join().unwrap();
        logger.close().await.unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_minimal_record_applies_budgets() {
        let mut big = sample();
        big.insert("user_agent".to_string(), Value::from("u".repeat(600)));
        let minimal = minimal_record(&big, 9000, 4096);
        assert_eq!(minimal["user_agent"].as_str().unwrap().len(), 512);
        assert_eq!(minimal["pid"], 7);
        assert!(!minimal.contains_key("cart"));
        assert!(!minimal.contains_key("x_forwarded_for"));

        big.insert("client_ip".to_string(), Value::from("203.0.113.7"));
        let minimal = minimal_record(&big, 9000, 4096);
        assert_eq!(minimal["client_ip"], "203.0.113.7");
    }

    #[test]
    fn test_cut_to_bytes_respects_char_boundaries() {
        assert_eq!(cut_to_bytes("héllo", 2), "h");
        assert_eq!(cut_to_bytes("héllo", 3), "hé");
        assert_eq!(cut_to_bytes("abc", 10), "abc");
    }
}
