// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-level facts detected once at startup.

pub mod clock;
pub mod hostname;

/// Hostname and pid stamped on every record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub hostname: String,
    pub pid: u32,
}

impl ProcessInfo {
    #[must_use]
    pub fn new(hostname: &str, pid: u32) -> Self {
        ProcessInfo {
            hostname: hostname.to_string(),
            pid,
        }
    }

    /// Detects the current process. A non-empty `hostname_override` skips
    /// hostname detection.
    #[must_use]
    pub fn detect(hostname_override: Option<&str>) -> Self {
        let hostname = match hostname_override.map(str::trim) {
            Some(hostname) if !hostname.is_empty() => hostname.to_string(),
            _ => hostname::get_hostname(),
        };
        ProcessInfo {
            hostname,
            pid: std::process::id(),
        }
    }
}
