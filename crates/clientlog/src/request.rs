// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request-derived context handed over by the transport layer.

use std::collections::HashMap;

pub const USER_AGENT_HEADER: &str = "user-agent";

/// Headers, query parameters and the resolved client IP of one request.
///
/// Header names are case-insensitive; query parameter names are not.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
    client_ip: Option<String>,
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_client_ip(mut self, ip: &str) -> Self {
        self.client_ip = Some(ip.to_string());
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    #[must_use]
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn client_ip(&self) -> Option<&str> {
        self.client_ip.as_deref()
    }

    #[must_use]
    pub fn user_agent(&self) -> Option<&str> {
        self.header(USER_AGENT_HEADER)
    }
}
