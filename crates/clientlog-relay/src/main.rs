// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod input;

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use clientlog::{
    config::{self, Config},
    logger::Formatter,
    DispatchReport, LoggerManager, Pipeline, ProcessInfo,
};

use input::{EventKind, InputEvent};

#[tokio::main]
pub async fn main() {
    let loaded = Config::load(&config::config_path());
    let log_level = match &loaded {
        Ok(config) => config.log_level.as_ref().to_string(),
        Err(_) => "info".to_string(),
    };
    init_logging(&log_level);

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading configuration: {e}");
            return;
        }
    };
    debug!(
        rules = config.rules.len(),
        destinations = config.destinations.len(),
        "configuration loaded"
    );

    let loggers = Arc::new(LoggerManager::with_marker(&config.truncation.marker));
    if let Err(e) = loggers.init_loggers(&config.destinations).await {
        warn!("Continuing without some destinations: {e}");
    }

    let process = Arc::new(ProcessInfo::detect(config.hostname.as_deref()));
    let pipeline = match Pipeline::new(&config, process, Arc::clone(&loggers)) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Error compiling rules: {e}");
            loggers.close_all().await;
            return;
        }
    };

    info!(
        destinations = ?loggers.enabled_logger_names().await,
        "clientlog relay started, reading events from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let response = handle_line(&pipeline, &line).await;
                    let mut out = response.to_string();
                    out.push('\n');
                    if let Err(e) = stdout.write_all(out.as_bytes()).await {
                        error!("Error writing response: {e}");
                        break;
                    }
                }
                Ok(None) => {
                    debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!("Error reading stdin: {e}");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("interrupted, shutting down");
                break;
            }
        }
    }

    loggers.close_all().await;
    info!("clientlog relay stopped");
}

fn init_logging(log_level: &str) {
    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(false)
        .without_time()
        .event_format(Formatter)
        .with_writer(std::io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

async fn handle_line(pipeline: &Pipeline, line: &str) -> Value {
    let event = match InputEvent::parse(line) {
        Ok(event) => event,
        Err(e) => {
            warn!("Ignoring malformed event: {e}");
            return json!({"error": format!("malformed event: {e}")});
        }
    };
    let context = event.context();

    match event.kind {
        EventKind::Log => match pipeline.handle(&event.client_event(), context.as_ref()).await {
            Ok(outcome) => {
                let scripts: Vec<&str> =
                    outcome.rules.scripts.iter().map(|s| s.url.as_str()).collect();
                let mut response = report_json(&outcome.dispatch);
                response["logged"] = Value::from(outcome.rules.should_log_to_server);
                response["scripts"] = json!(scripts);
                response
            }
            Err(e) => {
                warn!(site_id = %event.site_id, "Dropping event: {e}");
                json!({"error": e.to_string()})
            }
        },
        EventKind::ScriptDownload => {
            match pipeline
                .log_script_download(&event.site_id, &event.gtm_id, context.as_ref())
                .await
            {
                Ok(Some(report)) => {
                    let mut response = report_json(&report);
                    response["logged"] = Value::from(true);
                    response
                }
                Ok(None) => json!({"logged": false}),
                Err(e) => {
                    warn!(site_id = %event.site_id, "Dropping script download: {e}");
                    json!({"error": e.to_string()})
                }
            }
        }
    }
}

fn report_json(report: &DispatchReport) -> Value {
    let failed: Vec<Value> = report
        .failed
        .iter()
        .map(|(destination, error)| json!({"destination": destination, "error": error}))
        .collect();
    json!({"delivered": report.delivered, "failed": failed})
}
