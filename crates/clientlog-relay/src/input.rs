// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Newline-delimited input events.
//!
//! ```json
//! {"kind": "log", "site_id": "s1", "gtm_id": "GTM-1",
//!  "payload": {"message": "clicked", "level": 30},
//!  "request": {"headers": {"User-Agent": "curl/8"}, "query": {}, "client_ip": "10.0.0.1"}}
//! ```

use std::collections::HashMap;

use clientlog::{ClientEvent, LogRecord, RequestContext};
use serde::Deserialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    #[default]
    Log,
    ScriptDownload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InputRequest {
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub client_ip: Option<String>,
}

impl InputRequest {
    pub fn to_context(&self) -> RequestContext {
        let mut context = RequestContext::new();
        for (name, value) in &self.headers {
            context = context.with_header(name, value);
        }
        for (name, value) in &self.query {
            context = context.with_query(name, value);
        }
        if let Some(ip) = &self.client_ip {
            context = context.with_client_ip(ip);
        }
        context
    }
}

#[derive(Debug, Deserialize)]
pub struct InputEvent {
    #[serde(default)]
    pub kind: EventKind,
    pub site_id: String,
    #[serde(default)]
    pub gtm_id: String,
    #[serde(default)]
    pub payload: LogRecord,
    #[serde(default)]
    pub request: Option<InputRequest>,
}

impl InputEvent {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn client_event(&self) -> ClientEvent {
        ClientEvent {
            site_id: self.site_id.clone(),
            gtm_id: self.gtm_id.clone(),
            payload: self.payload.clone(),
        }
    }

    pub fn context(&self) -> Option<RequestContext> {
        self.request.as_ref().map(InputRequest::to_context)
    }
}
