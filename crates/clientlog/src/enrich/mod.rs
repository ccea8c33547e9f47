// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Canonical record construction.
//!
//! Every record starts from [`Enricher::create_base_record`] and is completed
//! by [`Enricher::enrich_and_merge`], which applies, in order:
//!
//! 1. rule-level `add_log_data` instructions,
//! 2. destination-level `add_log_data` instructions,
//! 3. the client payload, field by field (`message` becomes `msg`),
//! 4. the server clock, which always overwrites `time`,
//! 5. normalization of the required Bunyan fields.

use std::sync::Arc;

use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::config::{AddLogData, DataSource};
use crate::errors::EnrichError;
use crate::proc::{clock, ProcessInfo};
use crate::request::RequestContext;

/// A log record: field name to JSON value, keys kept sorted.
pub type LogRecord = Map<String, Value>;

pub const BUNYAN_VERSION: i64 = 0;

/// Bunyan severities.
pub mod level {
    pub const TRACE: i64 = 10;
    pub const DEBUG: i64 = 20;
    pub const INFO: i64 = 30;
    pub const WARN: i64 = 40;
    pub const ERROR: i64 = 50;
    pub const FATAL: i64 = 60;
}

pub const FIELD_VERSION: &str = "v";
pub const FIELD_NAME: &str = "name";
pub const FIELD_HOSTNAME: &str = "hostname";
pub const FIELD_PID: &str = "pid";
pub const FIELD_LEVEL: &str = "level";
pub const FIELD_TIME: &str = "time";
pub const FIELD_MSG: &str = "msg";
pub const FIELD_SITE_ID: &str = "site_id";
pub const FIELD_GTM_ID: &str = "gtm_id";
pub const FIELD_CLIENT_IP: &str = "client_ip";
pub const FIELD_USER_AGENT: &str = "user_agent";
/// Client payload key that is renamed to `msg`.
pub const PAYLOAD_MESSAGE: &str = "message";

#[derive(Clone, Debug)]
pub struct Enricher {
    process: Arc<ProcessInfo>,
    app_name: String,
}

impl Enricher {
    #[must_use]
    pub fn new(process: Arc<ProcessInfo>, app_name: &str) -> Self {
        Enricher {
            process,
            app_name: app_name.to_string(),
        }
    }

    #[must_use]
    pub fn process(&self) -> &ProcessInfo {
        &self.process
    }

    /// Builds the schema fields of a new record.
    #[must_use]
    pub fn create_base_record(
        &self,
        site_id: &str,
        gtm_id: &str,
        client_ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> LogRecord {
        let mut record = LogRecord::new();
        record.insert(FIELD_VERSION.to_string(), Value::from(BUNYAN_VERSION));
        record.insert(FIELD_NAME.to_string(), Value::from(self.app_name.as_str()));
        record.insert(
            FIELD_HOSTNAME.to_string(),
            Value::from(self.process.hostname.as_str()),
        );
        record.insert(FIELD_PID.to_string(), Value::from(self.process.pid));
        record.insert(FIELD_LEVEL.to_string(), Value::from(level::INFO));
        record.insert(FIELD_TIME.to_string(), Value::from(clock::now_rfc3339_nanos()));
        record.insert(FIELD_MSG.to_string(), Value::from(""));
        record.insert(FIELD_SITE_ID.to_string(), Value::from(site_id));
        if !gtm_id.is_empty() {
            record.insert(FIELD_GTM_ID.to_string(), Value::from(gtm_id));
        }
        record.insert(
            FIELD_CLIENT_IP.to_string(),
            Value::from(client_ip.unwrap_or_default()),
        );
        record.insert(
            FIELD_USER_AGENT.to_string(),
            Value::from(user_agent.unwrap_or_default()),
        );
        record
    }

    /// Produces the final record for one destination.
    ///
    /// # Errors
    ///
    /// [`EnrichError::InvalidLevel`] when an instruction assigns a `level`
    /// that does not parse as a number.
    pub fn enrich_and_merge(
        &self,
        base: &LogRecord,
        rule_instructions: &[AddLogData],
        destination_instructions: &[AddLogData],
        payload: &LogRecord,
        request: Option<&RequestContext>,
    ) -> Result<LogRecord, EnrichError> {
        let mut record = base.clone();

        for instruction in rule_instructions.iter().chain(destination_instructions) {
            apply_instruction(&mut record, instruction, payload, request)?;
        }

        for (key, value) in payload {
            if key == PAYLOAD_MESSAGE {
                let msg = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                record.insert(FIELD_MSG.to_string(), Value::String(msg));
            } else {
                record.insert(key.clone(), value.clone());
            }
        }

        record.insert(FIELD_TIME.to_string(), Value::from(clock::now_rfc3339_nanos()));
        self.normalize(&mut record);
        Ok(record)
    }

    fn normalize(&self, record: &mut LogRecord) {
        record.insert(FIELD_VERSION.to_string(), Value::from(BUNYAN_VERSION));

        if !record.get(FIELD_NAME).is_some_and(Value::is_string) {
            record.insert(FIELD_NAME.to_string(), Value::from(self.app_name.as_str()));
        }
        if !record.get(FIELD_HOSTNAME).is_some_and(Value::is_string) {
            record.insert(
                FIELD_HOSTNAME.to_string(),
                Value::from(self.process.hostname.as_str()),
            );
        }
        if !record.get(FIELD_PID).is_some_and(Value::is_number) {
            record.insert(FIELD_PID.to_string(), Value::from(self.process.pid));
        }

        let level = match record.remove(FIELD_LEVEL) {
            Some(Value::String(s)) => numeric_level(&s).unwrap_or(Value::String(s)),
            Some(Value::Null) | None => Value::from(level::INFO),
            Some(other) => other,
        };
        record.insert(FIELD_LEVEL.to_string(), level);

        let msg = match record.remove(FIELD_MSG) {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        record.insert(FIELD_MSG.to_string(), Value::String(msg));
    }
}

fn apply_instruction(
    record: &mut LogRecord,
    instruction: &AddLogData,
    payload: &LogRecord,
    request: Option<&RequestContext>,
) -> Result<(), EnrichError> {
    if instruction.is_deletion() {
        record.remove(&instruction.name);
        return Ok(());
    }

    let Some(value) = resolve(instruction, payload, request) else {
        debug!(field = %instruction.name, source = ?instruction.source, "enrichment value unavailable");
        return Ok(());
    };

    let value = if instruction.name == FIELD_LEVEL {
        match &value {
            Value::Number(_) => value,
            Value::String(s) => {
                numeric_level(s).ok_or_else(|| EnrichError::InvalidLevel(s.clone()))?
            }
            other => return Err(EnrichError::InvalidLevel(other.to_string())),
        }
    } else {
        value
    };

    record.insert(instruction.name.clone(), value);
    Ok(())
}

fn resolve(
    instruction: &AddLogData,
    payload: &LogRecord,
    request: Option<&RequestContext>,
) -> Option<Value> {
    let key = instruction.value.as_str();
    match instruction.source {
        DataSource::Static => Some(Value::from(key)),
        DataSource::Header => request
            .and_then(|r| r.header(key))
            .filter(|v| !v.is_empty())
            .map(Value::from),
        DataSource::Query => request
            .and_then(|r| r.query(key))
            .filter(|v| !v.is_empty())
            .map(Value::from),
        DataSource::Post => lookup_path(payload, key).cloned(),
    }
}

/// Follows a dot-separated path through nested objects. Numeric segments
/// also index into arrays.
fn lookup_path<'a>(payload: &'a LogRecord, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next().filter(|s| !s.is_empty())?;
    let start = payload.get(first)?;
    segments.try_fold(start, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Parses a numeric-looking level such as `"50"` or `" 35.5 "`.
fn numeric_level(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return Some(Value::from(n));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}
