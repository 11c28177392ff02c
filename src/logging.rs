use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt};

/// Filter applied when neither `FETCHPIPE_LOG` nor `RUST_LOG` is set: the
/// crate and its per-request events at info, everything else at warn.
const DEFAULT_FILTER: &str = "warn,fetchpipe=info,request_log=info";

/// Dedicated filter variable, so embedding applications can tune pipeline
/// logging without touching their own `RUST_LOG`.
const FILTER_ENV: &str = "FETCHPIPE_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Installs the global tracing subscriber. Applications embedding the
/// pipeline may skip this and install their own.
pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_env(FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        // The target distinguishes request_log events from crate
        // diagnostics, so text output keeps it visible.
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}
