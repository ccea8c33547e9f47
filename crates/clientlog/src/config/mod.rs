// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration Module
//!
//! Configuration is assembled with figment from, in increasing priority:
//!
//! 1. **Defaults** - `Config::default()` and serde defaults on each section
//! 2. **YAML file** - `clientlog.yaml`, or the path in `CLIENTLOG_CONFIG`
//! 3. **Environment variables** - `CLIENTLOG_*`, with `__` separating nested keys
//!    (e.g. `CLIENTLOG_TRUNCATION__MAX_ITERATIONS=50`)
//!
//! The loaded configuration is validated before any pipeline component is
//! built, so the rule processor and logger manager only ever see destination
//! names that are unique and rule targets that exist.

pub mod destination;
pub mod log_level;
pub mod rule;

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::Deserialize;

pub use destination::{
    FileFormat, FileSettings, GelfCompression, GelfProtocol, GelfSettings, LogDestination,
    RotationSettings, FILE_TYPE, GELF_TYPE,
};
pub use log_level::LogLevel;
pub use rule::{AddLogData, DataSource, HeaderCondition, Rule, RuleCondition, ScriptInjection};

use crate::errors::ConfigError;
use crate::truncate::TruncateConfig;

const ENV_PREFIX: &str = "CLIENTLOG_";
const CONFIG_PATH_ENV: &str = "CLIENTLOG_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "clientlog.yaml";
pub const DEFAULT_APP_NAME: &str = "clientlog";

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: LogLevel,
    /// Default `name` field of every record.
    pub app_name: String,
    /// Overrides hostname detection when set.
    pub hostname: Option<String>,
    pub truncation: TruncateConfig,
    pub rules: Vec<Rule>,
    pub destinations: Vec<LogDestination>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: LogLevel::default(),
            app_name: DEFAULT_APP_NAME.to_string(),
            hostname: None,
            truncation: TruncateConfig::default(),
            rules: Vec::new(),
            destinations: Vec::new(),
        }
    }
}

/// Path of the YAML file: `CLIENTLOG_CONFIG` if set, else `clientlog.yaml`.
#[must_use]
pub fn config_path() -> PathBuf {
    env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|p| !p.trim().is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

impl Config {
    /// Loads the YAML file at `path`, applies environment overrides and
    /// validates the result.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__").ignore(&["config"]));
        Self::from_figment(&figment)
    }

    pub fn from_figment(figment: &Figment) -> Result<Config, ConfigError> {
        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for dest in &self.destinations {
            let name = dest.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Invalid(
                    "destination name must not be empty".to_string(),
                ));
            }
            if !names.insert(name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate destination name '{name}'"
                )));
            }
            validate_destination(dest)?;
        }

        for (index, rule) in self.rules.iter().enumerate() {
            for target in &rule.log_destinations {
                if !names.contains(target.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "rule {index} targets unknown destination '{target}'"
                    )));
                }
            }
            validate_instructions(&rule.add_log_data, &format!("rule {index}"))?;
        }

        if self.truncation.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "truncation.max_iterations must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_destination(dest: &LogDestination) -> Result<(), ConfigError> {
    let invalid = |reason: &str| {
        Err(ConfigError::Invalid(format!(
            "destination '{}': {reason}",
            dest.name
        )))
    };

    match dest.kind.as_str() {
        FILE_TYPE => match &dest.file {
            Some(file) if !file.path.trim().is_empty() => {}
            Some(_) => return invalid("file.path must not be empty"),
            None => return invalid("missing file settings"),
        },
        GELF_TYPE => match &dest.gelf {
            Some(gelf) if gelf.host.trim().is_empty() => {
                return invalid("gelf.host must not be empty")
            }
            Some(gelf) if gelf.port == 0 => return invalid("gelf.port must not be zero"),
            Some(_) => {}
            None => return invalid("missing gelf settings"),
        },
        other => return invalid(&format!("unknown type '{other}'")),
    }

    validate_instructions(&dest.add_log_data, &format!("destination '{}'", dest.name))
}

fn validate_instructions(instructions: &[AddLogData], owner: &str) -> Result<(), ConfigError> {
    if instructions.iter().any(|i| i.name.trim().is_empty()) {
        return Err(ConfigError::Invalid(format!(
            "{owner}: add_log_data entries need a name"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
log_level: debug
app_name: storefront
rules:
  - condition:
      site_id: s1
    continue: true
    add_log_data:
      - name: env
        source: static
        value: staging
  - condition: {}
    log_destinations: [local]
destinations:
  - name: local
    type: file
    file:
      path: /tmp/clientlog.log
      format: text
  - name: graylog
    type: gelf
    enabled: false
    gelf:
      host: localhost
      port: 12201
      protocol: tcp
"#;

    #[test]
    fn test_load_yaml() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("clientlog.yaml", SAMPLE)?;
            let config = Config::load(Path::new("clientlog.yaml")).expect("config loads");

            assert_eq!(config.log_level, LogLevel::Debug);
            assert_eq!(config.app_name, "storefront");
            assert_eq!(config.rules.len(), 2);
            assert!(config.rules[0].continue_matching);
            assert_eq!(config.destinations[0].file.as_ref().unwrap().format, FileFormat::Text);
            assert!(!config.destinations[1].enabled);
            assert_eq!(
                config.destinations[1].gelf.as_ref().unwrap().protocol,
                GelfProtocol::Tcp
            );
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_yaml() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("clientlog.yaml", SAMPLE)?;
            jail.set_env("CLIENTLOG_APP_NAME", "checkout");
            jail.set_env("CLIENTLOG_TRUNCATION__MAX_ITERATIONS", "7");
            let config = Config::load(Path::new("clientlog.yaml")).expect("config loads");

            assert_eq!(config.app_name, "checkout");
            assert_eq!(config.truncation.max_iterations, 7);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            let config = Config::load(Path::new("absent.yaml")).expect("config loads");
            assert_eq!(config, Config::default());
            Ok(())
        });
    }

    #[test]
    fn test_config_path_from_env() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            assert_eq!(config_path(), PathBuf::from("clientlog.yaml"));
            jail.set_env("CLIENTLOG_CONFIG", "/etc/clientlog/main.yaml");
            assert_eq!(config_path(), PathBuf::from("/etc/clientlog/main.yaml"));
            Ok(())
        });
    }

    fn file_destination(name: &str) -> LogDestination {
        LogDestination::file(
            name,
            FileSettings {
                path: "/tmp/x.log".to_string(),
                ..FileSettings::default()
            },
        )
    }

    #[test]
    fn test_duplicate_destination_names_rejected() {
        let config = Config {
            destinations: vec![file_destination("a"), file_destination("a")],
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate destination name 'a'"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut dest = file_destination("a");
        dest.kind = "syslog".to_string();
        let config = Config {
            destinations: vec![dest],
            ..Config::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("unknown type"));
    }

    #[test]
    fn test_missing_type_settings_rejected() {
        let mut dest = file_destination("a");
        dest.file = None;
        let config = Config {
            destinations: vec![dest],
            ..Config::default()
        };
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("missing file settings"));
    }

    #[test]
    fn test_rule_with_unknown_target_rejected() {
        let config = Config {
            rules: vec![Rule {
                log_destinations: vec!["nowhere".to_string()],
                ..Rule::default()
            }],
            destinations: vec![file_destination("a")],
            ..Config::default()
        };
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("unknown destination 'nowhere'"));
    }

    #[test]
    fn test_unnamed_instruction_rejected() {
        let mut dest = file_destination("a");
        dest.add_log_data.push(AddLogData {
            name: " ".to_string(),
            source: DataSource::Static,
            value: "x".to_string(),
        });
        let config = Config {
            destinations: vec![dest],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
