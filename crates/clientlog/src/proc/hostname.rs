// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hostname detection utilities

use std::env;
use tracing::warn;

pub const HOSTNAME_OVERRIDE_ENV: &str = "CLIENTLOG_HOSTNAME";

/// Get the system hostname
///
/// This function tries multiple methods to determine the hostname:
/// 1. CLIENTLOG_HOSTNAME environment variable (if set)
/// 2. HOSTNAME environment variable
/// 3. System hostname via nix::unistd::gethostname()
/// 4. Fallback to "unknown" if all methods fail
#[must_use]
pub fn get_hostname() -> String {
    for var in [HOSTNAME_OVERRIDE_ENV, "HOSTNAME"] {
        if let Ok(hostname) = env::var(var) {
            if !hostname.trim().is_empty() {
                return hostname;
            }
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname_osstr) => {
            // Non-UTF8 hostnames fall through to the fallback.
            if let Some(hostname_str) = hostname_osstr.to_str() {
                if !hostname_str.is_empty() {
                    return hostname_str.to_string();
                }
            }
        }
        Err(e) => {
            warn!("Failed to get system hostname: {}", e);
        }
    }

    warn!("Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}
