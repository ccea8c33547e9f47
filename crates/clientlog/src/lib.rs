// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # clientlog
//!
//! Rule-driven ingestion of browser client log events.
//!
//! - [`rules`]: ordered rule evaluation deciding whether and where to log
//! - [`enrich`]: canonical Bunyan-style record construction
//! - [`truncate`]: size bounding of nested records
//! - [`loggers`]: file and GELF backends behind the [`loggers::Logger`] trait
//! - [`pipeline`]: the per-event flow tying them together
//! - [`config`]: figment-based configuration

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod enrich;
pub mod errors;
pub mod logger;
pub mod loggers;
pub mod pipeline;
pub mod proc;
pub mod request;
pub mod rules;
pub mod truncate;

pub use config::Config;
pub use enrich::{Enricher, LogRecord};
pub use errors::{ConfigError, EnrichError, LoggerError, PipelineError, RuleError, TruncateError};
pub use loggers::{DispatchReport, Logger, LoggerManager};
pub use pipeline::{ClientEvent, Pipeline, PipelineOutcome};
pub use proc::ProcessInfo;
pub use request::RequestContext;
pub use rules::{RuleEvaluationResult, RuleProcessor};
pub use truncate::{TruncateConfig, Truncator};
