// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log destination definitions.
//!
//! ```yaml
//! destinations:
//!   - name: local
//!     type: file
//!     file:
//!       path: /var/log/clientlog/events.log
//!       format: json
//!       rotation:
//!         max_size: 10485760
//!         max_backups: 5
//!   - name: graylog
//!     type: gelf
//!     max_message_size: 16384
//!     gelf:
//!       host: graylog.internal
//!       port: 12201
//!       protocol: udp
//!       compression: gzip
//! ```

use serde::Deserialize;

use crate::config::rule::AddLogData;

/// Destination type names understood by the logger factory.
pub const FILE_TYPE: &str = "file";
pub const GELF_TYPE: &str = "gelf";

/// Output format of the file backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// One Bunyan-compatible JSON object per line.
    #[default]
    Json,
    /// `[time] LEVEL: msg key=value ...`
    Text,
}

/// Rotation policy. Any non-zero field turns rotation on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    /// Maximum file size in bytes before rotating.
    pub max_size: u64,
    pub max_age_days: u64,
    pub max_backups: usize,
    /// Gzip rotated files.
    pub compress: bool,
}

impl RotationSettings {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.max_size > 0 || self.max_age_days > 0 || self.max_backups > 0
    }

    /// Configured size in whole megabytes, never below one megabyte for a
    /// positive size. Zero means no size-based rotation.
    #[must_use]
    pub fn max_size_megabytes(&self) -> u64 {
        const MEGABYTE: u64 = 1024 * 1024;
        if self.max_size == 0 {
            0
        } else {
            (self.max_size / MEGABYTE).max(1)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct FileSettings {
    pub path: String,
    #[serde(default)]
    pub format: FileFormat,
    #[serde(default)]
    pub rotation: RotationSettings,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GelfProtocol {
    #[default]
    Udp,
    Tcp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GelfCompression {
    #[default]
    None,
    Gzip,
    Zlib,
}

fn default_gelf_timeout() -> u64 {
    5
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct GelfSettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: GelfProtocol,
    /// Ignored for TCP, which always sends uncompressed frames.
    #[serde(default)]
    pub compression: GelfCompression,
    #[serde(default = "default_gelf_timeout")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

/// One configured output target.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LogDestination {
    pub name: String,
    /// Kept as a string so unsupported types fail that destination only.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Zero selects the backend's protocol default.
    #[serde(default)]
    pub max_message_size: usize,
    #[serde(default)]
    pub file: Option<FileSettings>,
    #[serde(default)]
    pub gelf: Option<GelfSettings>,
    /// Applied after rule-level instructions.
    #[serde(default)]
    pub add_log_data: Vec<AddLogData>,
}

impl LogDestination {
    #[must_use]
    pub fn file(name: &str, settings: FileSettings) -> Self {
        LogDestination {
            name: name.to_string(),
            kind: FILE_TYPE.to_string(),
            enabled: true,
            max_message_size: 0,
            file: Some(settings),
            gelf: None,
            add_log_data: Vec::new(),
        }
    }

    #[must_use]
    pub fn gelf(name: &str, settings: GelfSettings) -> Self {
        LogDestination {
            name: name.to_string(),
            kind: GELF_TYPE.to_string(),
            enabled: true,
            max_message_size: 0,
            file: None,
            gelf: Some(settings),
            add_log_data: Vec::new(),
        }
    }
}
