// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for each stage of the client log pipeline.

use std::fmt;

/// Errors raised while compiling the rule set.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("rule {rule}: invalid user agent pattern '{pattern}': {reason}")]
    InvalidGlob {
        rule: usize,
        pattern: String,
        reason: String,
    },

    #[error("rule {rule}: invalid IP or CIDR '{value}'")]
    InvalidCidr { rule: usize, value: String },
}

/// Errors raised while merging enrichment data into a record.
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error("level value '{0}' is not numeric")]
    InvalidLevel(String),
}

/// Errors raised by the truncation engine.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TruncateError {
    #[error("cannot bound the size of an empty value")]
    EmptyInput,

    #[error("size limit must be positive")]
    NonPositiveLimit,
}

/// Errors raised by logger backends and the logger manager.
#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("destination '{name}': unsupported type '{kind}'")]
    UnsupportedType { name: String, kind: String },

    #[error("destination '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("logger '{0}' is closed")]
    Closed(String),

    #[error("logger '{0}' lock poisoned")]
    LockPoisoned(String),

    #[error("blocking write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("send to {address} timed out")]
    Timeout { address: String },

    #[error("message of {size} bytes needs more than {max} GELF chunks")]
    TooManyChunks { size: usize, max: usize },

    #[error("failed to initialize {} destination(s): {}", .0.len(), InitFailures(.0))]
    Init(Vec<(String, LoggerError)>),
}

struct InitFailures<'a>(&'a [(String, LoggerError)]);

impl fmt::Display for InitFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, err)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{name}: {err}")?;
        }
        Ok(())
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

/// Errors surfaced to the caller of the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("enrichment failed for destination '{destination}': {source}")]
    Enrich {
        destination: String,
        #[source]
        source: EnrichError,
    },
}
