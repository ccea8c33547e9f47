// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rule evaluation.
//!
//! A [`RuleProcessor`] compiles the configured rules once and then evaluates
//! every request against them in order. Matching rules accumulate script
//! injections and enrichment instructions; the first matching rule without
//! `continue` fixes the logging decision and ends evaluation.

pub mod matcher;

use std::net::IpAddr;

use tracing::debug;

use crate::config::{AddLogData, HeaderCondition, Rule, ScriptInjection};
use crate::errors::RuleError;
use crate::request::RequestContext;
use matcher::{CidrMatcher, GlobMatcher};

/// Outcome of evaluating one request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleEvaluationResult {
    pub should_inject_scripts: bool,
    pub should_log_to_server: bool,
    pub should_log_script_downloads: bool,
    /// Unique by URL, in first-seen order.
    pub scripts: Vec<ScriptInjection>,
    /// Unique by name, in first-seen order, holding the last value seen.
    pub add_log_data: Vec<AddLogData>,
    /// `None` targets every enabled destination.
    pub target_destinations: Option<Vec<String>>,
}

impl RuleEvaluationResult {
    fn add_script(&mut self, script: &ScriptInjection) {
        if !self.scripts.iter().any(|s| s.url == script.url) {
            self.scripts.push(script.clone());
        }
    }

    fn add_instruction(&mut self, instruction: &AddLogData) {
        match self
            .add_log_data
            .iter_mut()
            .find(|existing| existing.name == instruction.name)
        {
            Some(existing) => *existing = instruction.clone(),
            None => self.add_log_data.push(instruction.clone()),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    rule: Rule,
    user_agents: Vec<GlobMatcher>,
    ips: Vec<CidrMatcher>,
    /// Lowercased header names.
    headers: Vec<(String, HeaderCondition)>,
}

impl CompiledRule {
    fn compile(index: usize, rule: &Rule) -> Result<Self, RuleError> {
        let user_agents = rule
            .condition
            .user_agents
            .iter()
            .map(|pattern| {
                GlobMatcher::new(pattern).map_err(|reason| RuleError::InvalidGlob {
                    rule: index,
                    pattern: pattern.clone(),
                    reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let ips = rule
            .condition
            .ips
            .iter()
            .map(|value| {
                CidrMatcher::parse(value).ok_or_else(|| RuleError::InvalidCidr {
                    rule: index,
                    value: value.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let headers = rule
            .condition
            .headers
            .iter()
            .map(|(name, condition)| (name.to_ascii_lowercase(), condition.clone()))
            .collect();

        Ok(CompiledRule {
            rule: rule.clone(),
            user_agents,
            ips,
            headers,
        })
    }

    fn matches(&self, site_id: &str, gtm_id: &str, request: Option<&RequestContext>) -> bool {
        let condition = &self.rule.condition;

        if let Some(expected) = &condition.site_id {
            if expected != site_id {
                return false;
            }
        }

        if !condition.gtm_ids.is_empty() && !condition.gtm_ids.iter().any(|id| id == gtm_id) {
            return false;
        }

        if !self.headers.is_empty() {
            let Some(request) = request else {
                return false;
            };
            let headers_match = self.headers.iter().all(|(name, expected)| {
                let actual = request.header(name);
                match expected {
                    HeaderCondition::Equals(value) => actual == Some(value.as_str()),
                    HeaderCondition::Present => actual.is_some(),
                    HeaderCondition::Absent => actual.is_none(),
                }
            });
            if !headers_match {
                return false;
            }
        }

        if !self.user_agents.is_empty() {
            let Some(user_agent) = request.and_then(RequestContext::user_agent) else {
                return false;
            };
            if !self.user_agents.iter().any(|glob| glob.is_match(user_agent)) {
                return false;
            }
        }

        if !self.ips.is_empty() {
            let Some(ip) = request
                .and_then(RequestContext::client_ip)
                .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
            else {
                return false;
            };
            if !self.ips.iter().any(|range| range.contains(&ip)) {
                return false;
            }
        }

        true
    }
}

/// Compiled, immutable rule set.
#[derive(Debug, Default)]
pub struct RuleProcessor {
    rules: Vec<CompiledRule>,
}

impl RuleProcessor {
    /// Compiles `rules`, pre-parsing every glob pattern and IP range.
    ///
    /// # Errors
    ///
    /// Fails on the first malformed user-agent pattern or IP range.
    pub fn new(rules: &[Rule]) -> Result<Self, RuleError> {
        let rules = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| CompiledRule::compile(index, rule))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RuleProcessor { rules })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluates a request against the rules in configured order.
    #[must_use]
    pub fn process(
        &self,
        site_id: &str,
        gtm_id: &str,
        request: Option<&RequestContext>,
    ) -> RuleEvaluationResult {
        let mut result = RuleEvaluationResult::default();

        for (index, compiled) in self.rules.iter().enumerate() {
            let rule = &compiled.rule;
            if !rule.enabled || !compiled.matches(site_id, gtm_id, request) {
                continue;
            }

            result.should_inject_scripts = true;
            for instruction in &rule.add_log_data {
                result.add_instruction(instruction);
            }
            for script in &rule.script_injection {
                result.add_script(script);
            }

            if rule.continue_matching {
                debug!(rule = index, site_id, "continue rule matched");
                continue;
            }

            result.should_log_to_server = true;
            result.should_log_script_downloads = rule.log_script_downloads;
            result.target_destinations = if rule.log_destinations.is_empty() {
                None
            } else {
                Some(rule.log_destinations.clone())
            };
            debug!(rule = index, site_id, "terminating rule matched");
            break;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataSource, RuleCondition};
    use std::collections::HashMap;

    fn data(name: &str, value: &str) -> AddLogData {
        AddLogData {
            name: name.to_string(),
            source: DataSource::Static,
            value: value.to_string(),
        }
    }

    fn script(url: &str, is_async: bool) -> ScriptInjection {
        ScriptInjection {
            url: url.to_string(),
            is_async,
            defer: false,
        }
    }

    fn site_rule(site_id: &str) -> Rule {
        Rule {
            condition: RuleCondition {
                site_id: Some(site_id.to_string()),
                ..RuleCondition::default()
            },
            ..Rule::default()
        }
    }

    #[test]
    fn test_empty_condition_always_matches() {
        let processor = RuleProcessor::new(&[Rule::default()]).unwrap();
        let result = processor.process("any", "", None);
        assert!(result.should_log_to_server);
        assert!(result.should_inject_scripts);
        assert_eq!(result.target_destinations, None);
    }

    #[test]
    fn test_no_rules_disables_logging() {
        let processor = RuleProcessor::new(&[]).unwrap();
        assert_eq!(processor.process("s1", "g1", None), RuleEvaluationResult::default());
    }

    #[test]
    fn test_continue_then_terminating_rule() {
        let rules = vec![
            Rule {
                continue_matching: true,
                add_log_data: vec![data("env", "staging")],
                ..site_rule("s1")
            },
            Rule {
                log_destinations: vec!["d1".to_string()],
                ..Rule::default()
            },
        ];
        let processor = RuleProcessor::new(&rules).unwrap();
        let result = processor.process("s1", "", None);

        assert!(result.should_log_to_server);
        assert_eq!(result.target_destinations, Some(vec!["d1".to_string()]));
        assert_eq!(result.add_log_data, vec![data("env", "staging")]);
    }

    #[test]
    fn test_first_terminating_rule_wins() {
        let rules = vec![
            Rule {
                log_destinations: vec!["first".to_string()],
                log_script_downloads: true,
                ..site_rule("s1")
            },
            Rule {
                log_destinations: vec!["second".to_string()],
                add_log_data: vec![data("late", "x")],
                ..Rule::default()
            },
        ];
        let processor = RuleProcessor::new(&rules).unwrap();
        let result = processor.process("s1", "", None);
        assert_eq!(result.target_destinations, Some(vec!["first".to_string()]));
        assert!(result.should_log_script_downloads);
        assert!(result.add_log_data.is_empty());

        let other = processor.process("s2", "", None);
        assert_eq!(other.target_destinations, Some(vec!["second".to_string()]));
        assert!(!other.should_log_script_downloads);
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let rules = vec![
            Rule {
                enabled: false,
                log_destinations: vec!["off".to_string()],
                ..Rule::default()
            },
            Rule {
                log_destinations: vec!["on".to_string()],
                ..Rule::default()
            },
        ];
        let processor = RuleProcessor::new(&rules).unwrap();
        let result = processor.process("s1", "", None);
        assert_eq!(result.target_destinations, Some(vec!["on".to_string()]));
    }

    #[test]
    fn test_only_continue_matches_keeps_scripts_without_logging() {
        let rules = vec![Rule {
            continue_matching: true,
            script_injection: vec![script("https://cdn/a.js", false)],
            ..Rule::default()
        }];
        let processor = RuleProcessor::new(&rules).unwrap();
        let result = processor.process("s1", "", None);
        assert!(result.should_inject_scripts);
        assert!(!result.should_log_to_server);
        assert_eq!(result.scripts.len(), 1);
    }

    #[test]
    fn test_instruction_last_write_wins_in_first_position() {
        let rules = vec![
            Rule {
                continue_matching: true,
                add_log_data: vec![data("env", "one"), data("team", "web")],
                ..Rule::default()
            },
            Rule {
                add_log_data: vec![data("env", "two")],
                ..Rule::default()
            },
        ];
        let processor = RuleProcessor::new(&rules).unwrap();
        let result = processor.process("s1", "", None);
        assert_eq!(
            result.add_log_data,
            vec![data("env", "two"), data("team", "web")]
        );
    }

    #[test]
    fn test_scripts_deduplicated_first_wins() {
        let rules = vec![
            Rule {
                continue_matching: true,
                script_injection: vec![script("https://cdn/a.js", true)],
                ..Rule::default()
            },
            Rule {
                script_injection: vec![
                    script("https://cdn/a.js", false),
                    script("https://cdn/b.js", false),
                ],
                ..Rule::default()
            },
        ];
        let processor = RuleProcessor::new(&rules).unwrap();
        let result = processor.process("s1", "", None);
        assert_eq!(
            result.scripts,
            vec![script("https://cdn/a.js", true), script("https://cdn/b.js", false)]
        );
    }

    #[test]
    fn test_gtm_id_membership() {
        let rules = vec![Rule {
            condition: RuleCondition {
                gtm_ids: vec!["GTM-A".to_string(), "GTM-B".to_string()],
                ..RuleCondition::default()
            },
            ..Rule::default()
        }];
        let processor = RuleProcessor::new(&rules).unwrap();
        assert!(processor.process("s", "GTM-B", None).should_log_to_server);
        assert!(!processor.process("s", "GTM-C", None).should_log_to_server);
    }

    fn header_rule(conditions: &[(&str, HeaderCondition)]) -> Rule {
        let headers: HashMap<String, HeaderCondition> = conditions
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        Rule {
            condition: RuleCondition {
                headers,
                ..RuleCondition::default()
            },
            ..Rule::default()
        }
    }

    #[test]
    fn test_header_conditions() {
        let processor = RuleProcessor::new(&[header_rule(&[
            ("X-Env", HeaderCondition::Equals("prod".to_string())),
            ("x-debug", HeaderCondition::Present),
            ("x-bot", HeaderCondition::Absent),
        ])])
        .unwrap();

        let matching = RequestContext::new()
            .with_header("x-env", "prod")
            .with_header("X-Debug", "1");
        assert!(processor.process("s", "", Some(&matching)).should_log_to_server);

        let bot = matching.clone().with_header("x-bot", "yes");
        assert!(!processor.process("s", "", Some(&bot)).should_log_to_server);

        let wrong_env = RequestContext::new()
            .with_header("x-env", "dev")
            .with_header("x-debug", "1");
        assert!(!processor.process("s", "", Some(&wrong_env)).should_log_to_server);
    }

    #[test]
    fn test_header_condition_without_context_is_non_match() {
        let processor =
            RuleProcessor::new(&[header_rule(&[("x-bot", HeaderCondition::Absent)])]).unwrap();
        assert!(!processor.process("s", "", None).should_log_to_server);
    }

    #[test]
    fn test_user_agent_globs() {
        let rules = vec![Rule {
            condition: RuleCondition {
                user_agents: vec!["*Googlebot*".to_string(), "curl/*".to_string()],
                ..RuleCondition::default()
            },
            ..Rule::default()
        }];
        let processor = RuleProcessor::new(&rules).unwrap();

        let curl = RequestContext::new().with_header("user-agent", "curl/8.1");
        assert!(processor.process("s", "", Some(&curl)).should_log_to_server);

        let firefox = RequestContext::new().with_header("user-agent", "Firefox/120");
        assert!(!processor.process("s", "", Some(&firefox)).should_log_to_server);

        assert!(!processor.process("s", "", None).should_log_to_server);
    }

    #[test]
    fn test_ip_ranges() {
        let rules = vec![Rule {
            condition: RuleCondition {
                ips: vec!["10.0.0.0/8".to_string(), "192.168.1.7".to_string()],
                ..RuleCondition::default()
            },
            ..Rule::default()
        }];
        let processor = RuleProcessor::new(&rules).unwrap();

        let inside = RequestContext::new().with_client_ip("10.1.2.3");
        assert!(processor.process("s", "", Some(&inside)).should_log_to_server);

        let exact = RequestContext::new().with_client_ip("192.168.1.7");
        assert!(processor.process("s", "", Some(&exact)).should_log_to_server);

        let outside = RequestContext::new().with_client_ip("172.16.0.1");
        assert!(!processor.process("s", "", Some(&outside)).should_log_to_server);

        let garbage = RequestContext::new().with_client_ip("unknown");
        assert!(!processor.process("s", "", Some(&garbage)).should_log_to_server);

        assert!(!processor.process("s", "", Some(&RequestContext::new())).should_log_to_server);
    }

    #[test]
    fn test_criteria_are_combined() {
        let rules = vec![Rule {
            condition: RuleCondition {
                site_id: Some("s1".to_string()),
                ips: vec!["10.0.0.0/8".to_string()],
                ..RuleCondition::default()
            },
            ..Rule::default()
        }];
        let processor = RuleProcessor::new(&rules).unwrap();
        let ctx = RequestContext::new().with_client_ip("10.0.0.1");
        assert!(processor.process("s1", "", Some(&ctx)).should_log_to_server);
        assert!(!processor.process("s2", "", Some(&ctx)).should_log_to_server);
    }

    #[test]
    fn test_malformed_patterns_fail_construction() {
        let bad_glob = Rule {
            condition: RuleCondition {
                user_agents: vec!["Mozilla[".to_string()],
                ..RuleCondition::default()
            },
            ..Rule::default()
        };
        let err = RuleProcessor::new(&[Rule::default(), bad_glob]).unwrap_err();
        assert!(matches!(err, RuleError::InvalidGlob { rule: 1, .. }));

        let bad_cidr = Rule {
            condition: RuleCondition {
                ips: vec!["300.0.0.0/8".to_string()],
                ..RuleCondition::default()
            },
            ..Rule::default()
        };
        let err = RuleProcessor::new(&[bad_cidr]).unwrap_err();
        assert!(matches!(err, RuleError::InvalidCidr { rule: 0, .. }));
    }
}
