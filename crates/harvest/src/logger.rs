// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log formatting for the harvest's own diagnostics.
//!
//! Every line is prefixed with `HARVEST` so it can be told apart from the
//! host application's output:
//!
//! ```text
//! HARVEST | DEBUG | Harvest ready for TXN_EVENTS|LOG_EVENTS
//! HARVEST | WARN | flush{endpoint="metric_data"}: Retryable failure, merging back
//! ```

use std::fmt;

use tracing::debug;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::log_level::LogLevel;

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
        let metadata = event.metadata();
        write!(&mut writer, "HARVEST | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

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

/// Builds the filter for `level`, letting `RUST_LOG` override it.
#[must_use]
pub fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_ref().to_lowercase()))
}

/// Installs the global subscriber. Later calls are ignored.
pub fn init(level: LogLevel) {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(level))
        .event_format(Formatter)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        debug!("Logging subsystem enabled");
    }
}
