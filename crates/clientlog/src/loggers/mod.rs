// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destination backends and their lifecycle.
//!
//! Each enabled destination owns one long-lived [`Logger`]. The
//! [`LoggerManager`] keeps them in a map guarded by a reader/writer lock:
//! dispatches share the lock, re-initialization takes it exclusively.
//! Records are fanned out to their destinations in parallel and every
//! destination succeeds or fails on its own.

pub mod file;
pub mod gelf;
pub mod rotate;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::config::{LogDestination, FILE_TYPE, GELF_TYPE};
use crate::enrich::{level, LogRecord};
use crate::errors::LoggerError;
use crate::truncate::DEFAULT_MARKER;

pub use file::FileLogger;
pub use gelf::GelfLogger;

/// A destination backend.
#[async_trait]
pub trait Logger: Send + Sync + fmt::Debug {
    /// Destination name.
    fn name(&self) -> &str;

    /// Effective wire size limit in bytes.
    fn max_message_size(&self) -> usize;

    async fn log(&self, record: LogRecord) -> Result<(), LoggerError>;

    /// Flushes and releases the underlying resources. Later calls to `log`
    /// fail with [`LoggerError::Closed`].
    async fn close(&self) -> Result<(), LoggerError>;
}

/// Builds the backend for `destination`. `marker` is appended to message
/// fields the backend has to cut.
///
/// # Errors
///
/// [`LoggerError::UnsupportedType`] for unknown types, or whatever the backend
/// raises while opening its resources.
pub async fn create_logger(
    destination: &LogDestination,
    marker: &str,
) -> Result<Arc<dyn Logger>, LoggerError> {
    let settings_missing = || LoggerError::InvalidConfig {
        name: destination.name.clone(),
        reason: format!("missing {} settings", destination.kind),
    };

    match destination.kind.as_str() {
        FILE_TYPE => {
            let settings = destination.file.as_ref().ok_or_else(settings_missing)?;
            let logger =
                FileLogger::open(&destination.name, settings, destination.max_message_size)?;
            Ok(Arc::new(logger))
        }
        GELF_TYPE => {
            let settings = destination.gelf.as_ref().ok_or_else(settings_missing)?;
            let logger = GelfLogger::new(&destination.name, settings, destination.max_message_size)
                .with_marker(marker);
            Ok(Arc::new(logger))
        }
        other => Err(LoggerError::UnsupportedType {
            name: destination.name.clone(),
            kind: other.to_string(),
        }),
    }
}

/// Outcome of one fan-out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Destinations that accepted the record, sorted by name.
    pub delivered: Vec<String>,
    /// Destinations that did not, with the reason, sorted by name.
    pub failed: Vec<(String, String)>,
}

impl DispatchReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn sort(&mut self) {
        self.delivered.sort();
        self.failed.sort();
    }
}

#[derive(Debug)]
pub struct LoggerManager {
    loggers: RwLock<HashMap<String, Arc<dyn Logger>>>,
    marker: String,
}

impl Default for LoggerManager {
    fn default() -> Self {
        Self::with_marker(DEFAULT_MARKER)
    }
}

impl LoggerManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backends created by this manager cut messages with `marker`.
    #[must_use]
    pub fn with_marker(marker: &str) -> Self {
        LoggerManager {
            loggers: RwLock::new(HashMap::new()),
            marker: marker.to_string(),
        }
    }

    /// Replaces the current loggers with one per enabled destination.
    ///
    /// Existing loggers are closed first; close failures are only logged.
    /// A destination that fails to initialize does not prevent the others.
    ///
    /// # Errors
    ///
    /// [`LoggerError::Init`] listing every destination that failed.
    pub async fn init_loggers(&self, destinations: &[LogDestination]) -> Result<(), LoggerError> {
        let mut loggers = self.loggers.write().await;

        for (name, logger) in loggers.drain() {
            if let Err(e) = logger.close().await {
                warn!(destination = %name, error = %e, "failed to close logger");
            }
        }

        let mut failures = Vec::new();
        for destination in destinations.iter().filter(|d| d.enabled) {
            match create_logger(destination, &self.marker).await {
                Ok(logger) => {
                    debug!(destination = %destination.name, kind = %destination.kind, "logger initialized");
                    loggers.insert(destination.name.clone(), logger);
                }
                Err(e) => {
                    error!(destination = %destination.name, error = %e, "failed to initialize logger");
                    failures.push((destination.name.clone(), e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LoggerError::Init(failures))
        }
    }

    pub async fn get_logger(&self, name: &str) -> Option<Arc<dyn Logger>> {
        self.loggers.read().await.get(name).cloned()
    }

    /// Names of the live loggers, sorted.
    pub async fn enabled_logger_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loggers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Delivers each record to its destination concurrently and waits for
    /// all of them.
    pub async fn dispatch(&self, deliveries: Vec<(String, LogRecord)>) -> DispatchReport {
        let loggers = self.loggers.read().await;
        let mut report = DispatchReport::default();
        let mut pending = HashSet::new();
        let mut tasks = JoinSet::new();

        for (name, record) in deliveries {
            let Some(logger) = loggers.get(&name).cloned() else {
                warn!(destination = %name, "no logger for destination");
                report
                    .failed
                    .push((name, "unknown destination".to_string()));
                continue;
            };
            pending.insert(name.clone());
            tasks.spawn(async move {
                let result = logger.log(record).await;
                (name, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    pending.remove(&name);
                    report.delivered.push(name);
                }
                Ok((name, Err(e))) => {
                    error!(destination = %name, error = %e, "failed to deliver record");
                    pending.remove(&name);
                    report.failed.push((name, e.to_string()));
                }
                Err(e) => error!(error = %e, "delivery task failed"),
            }
        }

        // Whatever is still pending belonged to a task that panicked.
        for name in pending {
            report
                .failed
                .push((name, "delivery task failed".to_string()));
        }

        report.sort();
        report
    }

    /// Closes every logger concurrently. Failures are logged.
    pub async fn close_all(&self) {
        let loggers: Vec<(String, Arc<dyn Logger>)> =
            self.loggers.write().await.drain().collect();

        let mut tasks = JoinSet::new();
        for (name, logger) in loggers {
            tasks.spawn(async move { (name, logger.close().await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(destination = %name, "logger closed"),
                Ok((name, Err(e))) => {
                    error!(destination = %name, error = %e, "failed to close logger");
                }
                Err(e) => error!(error = %e, "close task failed"),
            }
        }
    }
}

/// Upper-case severity name for a record's `level`, as used in text lines.
#[must_use]
pub fn level_name(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_uppercase(),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v >= level::FATAL as f64 => "FATAL".to_string(),
            Some(v) if v >= level::ERROR as f64 => "ERROR".to_string(),
            Some(v) if v >= level::WARN as f64 => "WARN".to_string(),
            Some(v) if v >= level::INFO as f64 => "INFO".to_string(),
            Some(v) if v >= level::DEBUG as f64 => "DEBUG".to_string(),
            _ => "TRACE".to_string(),
        },
        _ => "INFO".to_string(),
    }
}
