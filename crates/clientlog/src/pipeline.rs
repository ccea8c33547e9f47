// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-event control flow.
//!
//! ```text
//! rules -> (per target) enrich -> bound size -> dispatch
//! ```
//!
//! Every target record is built before anything is dispatched, so an
//! enrichment error drops the event for all destinations.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{AddLogData, Config, LogDestination};
use crate::enrich::{Enricher, LogRecord, PAYLOAD_MESSAGE};
use crate::errors::{PipelineError, RuleError};
use crate::loggers::{DispatchReport, LoggerManager};
use crate::proc::ProcessInfo;
use crate::request::RequestContext;
use crate::rules::{RuleEvaluationResult, RuleProcessor};
use crate::truncate::Truncator;

pub const SCRIPT_DOWNLOAD_MESSAGE: &str = "script download";
pub const SCRIPT_DOWNLOAD_EVENT: &str = "script_download";

/// A log event as submitted by a browser client.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientEvent {
    pub site_id: String,
    pub gtm_id: String,
    pub payload: LogRecord,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub rules: RuleEvaluationResult,
    /// Empty when the rules decided not to log.
    pub dispatch: DispatchReport,
}

#[derive(Debug)]
pub struct Pipeline {
    processor: RuleProcessor,
    enricher: Enricher,
    truncator: Truncator,
    destinations: HashMap<String, LogDestination>,
    loggers: Arc<LoggerManager>,
}

impl Pipeline {
    /// Compiles the rules of `config`. Loggers are owned by `loggers` and
    /// initialized separately.
    ///
    /// # Errors
    ///
    /// Fails on malformed user-agent patterns or IP ranges.
    pub fn new(
        config: &Config,
        process: Arc<ProcessInfo>,
        loggers: Arc<LoggerManager>,
    ) -> Result<Self, RuleError> {
        Ok(Pipeline {
            processor: RuleProcessor::new(&config.rules)?,
            enricher: Enricher::new(process, &config.app_name),
            truncator: Truncator::new(config.truncation.clone()),
            destinations: config
                .destinations
                .iter()
                .map(|d| (d.name.clone(), d.clone()))
                .collect(),
            loggers,
        })
    }

    #[must_use]
    pub fn loggers(&self) -> &Arc<LoggerManager> {
        &self.loggers
    }

    /// Evaluates, enriches, bounds and delivers one client event.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Enrich`] when any target record cannot be built; in
    /// that case nothing is delivered.
    pub async fn handle(
        &self,
        event: &ClientEvent,
        request: Option<&RequestContext>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let rules = self
            .processor
            .process(&event.site_id, &event.gtm_id, request);

        if !rules.should_log_to_server {
            debug!(site_id = %event.site_id, "no terminating rule matched, not logging");
            return Ok(PipelineOutcome {
                rules,
                dispatch: DispatchReport::default(),
            });
        }

        let dispatch = self
            .deliver(&rules, &event.site_id, &event.gtm_id, &event.payload, request)
            .await?;
        Ok(PipelineOutcome { rules, dispatch })
    }

    /// Records that a client downloaded its script, when the terminating rule
    /// asks for it. Returns `None` when nothing was logged.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Enrich`] as for [`Pipeline::handle`].
    pub async fn log_script_download(
        &self,
        site_id: &str,
        gtm_id: &str,
        request: Option<&RequestContext>,
    ) -> Result<Option<DispatchReport>, PipelineError> {
        let rules = self.processor.process(site_id, gtm_id, request);
        if !rules.should_log_script_downloads {
            return Ok(None);
        }

        let mut payload = LogRecord::new();
        payload.insert(
            PAYLOAD_MESSAGE.to_string(),
            Value::from(SCRIPT_DOWNLOAD_MESSAGE),
        );
        payload.insert("event".to_string(), Value::from(SCRIPT_DOWNLOAD_EVENT));

        let report = self
            .deliver(&rules, site_id, gtm_id, &payload, request)
            .await?;
        Ok(Some(report))
    }

    async fn deliver(
        &self,
        rules: &RuleEvaluationResult,
        site_id: &str,
        gtm_id: &str,
        payload: &LogRecord,
        request: Option<&RequestContext>,
    ) -> Result<DispatchReport, PipelineError> {
        let targets = match &rules.target_destinations {
            Some(targets) => targets.clone(),
            None => self.loggers.enabled_logger_names().await,
        };

        let base = self.enricher.create_base_record(
            site_id,
            gtm_id,
            request.and_then(RequestContext::client_ip),
            request.and_then(RequestContext::user_agent),
        );

        let mut deliveries = Vec::with_capacity(targets.len());
        for target in targets {
            let destination_instructions: &[AddLogData] = self
                .destinations
                .get(&target)
                .map(|d| d.add_log_data.as_slice())
                .unwrap_or_default();

            let record = self
                .enricher
                .enrich_and_merge(
                    &base,
                    &rules.add_log_data,
                    destination_instructions,
                    payload,
                    request,
                )
                .map_err(|source| PipelineError::Enrich {
                    destination: target.clone(),
                    source,
                })?;

            let record = match self.loggers.get_logger(&target).await {
                Some(logger) => self.bound(&target, record, logger.max_message_size()),
                None => record,
            };
            deliveries.push((target, record));
        }

        Ok(self.loggers.dispatch(deliveries).await)
    }

    fn bound(&self, destination: &str, record: LogRecord, limit: usize) -> LogRecord {
        let mut value = Value::Object(record);
        match self.truncator.bound_size(&mut value, limit) {
            Ok(true) => debug!(destination, limit, "record truncated"),
            Ok(false) => {}
            Err(e) => warn!(destination, error = %e, "could not bound record size"),
        }
        match value {
            Value::Object(record) => record,
            _ => LogRecord::new(),
        }
    }
}
