// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Formatter for the service's own diagnostics.
//!
//! ```text
//! CLIENTLOG | LEVEL | [span{fields}: ]message fields
//! CLIENTLOG | ERROR | failed to deliver record destination=graylog error=send to graylog:12201 timed out
//! ```
//!
//! ```rust,ignore
//! let subscriber = tracing_subscriber::fmt::Subscriber::builder()
//!     .with_env_filter(EnvFilter::new("info"))
//!     .event_format(clientlog::logger::Formatter)
//!     .finish();
//! tracing::subscriber::set_global_default(subscriber)?;
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

pub const PREFIX: &str = "CLIENTLOG";

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "{PREFIX} | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                // The fmt layer stores formatted span fields on creation.
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
