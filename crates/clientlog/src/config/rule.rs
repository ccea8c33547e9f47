// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rule definitions as they appear in configuration.
//!
//! Rules are evaluated in the order they are defined. Continue rules only
//! accumulate enrichment instructions and script injections, while the first
//! matching rule without `continue` decides whether and where to log.
//!
//! # Example Rules
//!
//! ```yaml
//! rules:
//!   # Tag every staging site, keep evaluating
//!   - condition:
//!       site_id: staging-site
//!     continue: true
//!     add_log_data:
//!       - name: env
//!         source: static
//!         value: staging
//!
//!   # Log everything else to the local file only
//!   - condition: {}
//!     log_destinations: [local]
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;

/// Where the value of an enrichment instruction comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// The instruction's `value` is used literally.
    Static,
    /// The instruction's `value` names a request header.
    Header,
    /// The instruction's `value` names a query parameter.
    Query,
    /// The instruction's `value` is a dot-separated path into the client payload.
    Post,
}

/// A single `add_log_data` entry.
///
/// A static instruction whose value is the literal string `"false"` deletes
/// the field named `name` instead of assigning it.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AddLogData {
    pub name: String,
    pub source: DataSource,
    #[serde(default)]
    pub value: String,
}

impl AddLogData {
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.source == DataSource::Static && self.value == "false"
    }
}

/// A script the client should load. Identity is the URL alone.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ScriptInjection {
    pub url: String,
    #[serde(default, rename = "async")]
    pub is_async: bool,
    #[serde(default)]
    pub defer: bool,
}

/// Expected state of a request header.
///
/// Deserializes from a string (exact match) or a boolean (`true` = must
/// exist, `false` = must not exist).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderCondition {
    Equals(String),
    Present,
    Absent,
}

impl<'de> Deserialize<'de> for HeaderCondition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match JsonValue::deserialize(deserializer)? {
            JsonValue::Bool(true) => Ok(HeaderCondition::Present),
            JsonValue::Bool(false) => Ok(HeaderCondition::Absent),
            JsonValue::String(s) => Ok(HeaderCondition::Equals(s)),
            other => Err(serde::de::Error::custom(format!(
                "header condition must be a string or a boolean, got {other}"
            ))),
        }
    }
}

/// Criteria a request must satisfy. Only the criteria that are set take part
/// in matching; an empty condition matches every request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuleCondition {
    pub site_id: Option<String>,
    pub gtm_ids: Vec<String>,
    pub user_agents: Vec<String>,
    pub ips: Vec<String>,
    pub headers: HashMap<String, HeaderCondition>,
}

impl RuleCondition {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.site_id.is_none()
            && self.gtm_ids.is_empty()
            && self.user_agents.is_empty()
            && self.ips.is_empty()
            && self.headers.is_empty()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub condition: RuleCondition,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// When set, a match only accumulates effects and never ends evaluation.
    #[serde(default, rename = "continue")]
    pub continue_matching: bool,
    #[serde(default)]
    pub add_log_data: Vec<AddLogData>,
    #[serde(default)]
    pub script_injection: Vec<ScriptInjection>,
    #[serde(default)]
    pub log_script_downloads: bool,
    /// Explicit target destinations. Empty means every enabled destination.
    #[serde(default)]
    pub log_destinations: Vec<String>,
}

impl Default for Rule {
    fn default() -> Self {
        Rule {
            condition: RuleCondition::default(),
            enabled: true,
            continue_matching: false,
            add_log_data: Vec::new(),
            script_injection: Vec::new(),
            log_script_downloads: false,
            log_destinations: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_defaults() {
        let rule: Rule = serde_json::from_value(json!({})).unwrap();
        assert!(rule.enabled);
        assert!(!rule.continue_matching);
        assert!(rule.condition.is_empty());
        assert_eq!(rule, Rule::default());
    }

    #[test]
    fn test_header_condition_forms() {
        let condition: RuleCondition = serde_json::from_value(json!({
            "headers": {"x-debug": true, "x-bot": false, "x-env": "prod"}
        }))
        .unwrap();
        assert_eq!(condition.headers["x-debug"], HeaderCondition::Present);
        assert_eq!(condition.headers["x-bot"], HeaderCondition::Absent);
        assert_eq!(
            condition.headers["x-env"],
            HeaderCondition::Equals("prod".to_string())
        );
    }

    #[test]
    fn test_header_condition_rejects_numbers() {
        let result: Result<HeaderCondition, _> = serde_json::from_value(json!(5));
        assert!(result.is_err());
    }

    #[test]
    fn test_full_rule() {
        let rule: Rule = serde_json::from_value(json!({
            "condition": {"site_id": "s1", "gtm_ids": ["GTM-1"]},
            "continue": true,
            "add_log_data": [
                {"name": "env", "source": "static", "value": "staging"},
                {"name": "ref", "source": "header", "value": "referer"}
            ],
            "script_injection": [{"url": "https://cdn/x.js", "async": true}],
            "log_destinations": ["d1"]
        }))
        .unwrap();
        assert!(rule.continue_matching);
        assert_eq!(rule.add_log_data[1].source, DataSource::Header);
        assert!(rule.script_injection[0].is_async);
        assert!(!rule.script_injection[0].defer);
    }

    #[test]
    fn test_static_false_is_deletion() {
        let data = AddLogData {
            name: "user_agent".to_string(),
            source: DataSource::Static,
            value: "false".to_string(),
        };
        assert!(data.is_deletion());

        let header = AddLogData {
            source: DataSource::Header,
            ..data
        };
        assert!(!header.is_deletion());
    }
}
