use crate::error::{Error, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Filter applied when no directive is passed and `RUST_LOG` is unset or
/// unusable: hopdb events from `info` up, everything else from `warn`.
pub const DEFAULT_FILTER: &str = "hopdb=info,warn";

/// Builds the event filter for [`init_logging`].
///
/// An explicit `directive` (e.g. `"hopdb::storage=debug"`) must parse.
/// Without one, `RUST_LOG` is used if it parses, else [`DEFAULT_FILTER`].
pub fn log_filter(directive: Option<&str>) -> Result<EnvFilter> {
    match directive {
        Some(directive) => EnvFilter::try_new(directive)
            .map_err(|e| Error::InvalidArgument(format!("invalid log filter {directive:?}: {e}"))),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}

/// Installs a global `fmt` subscriber for store events, tagged with their
/// module target and the name of the thread whose transactor emitted them.
pub fn init_logging(directive: Option<&str>) -> Result<()> {
    fmt()
        .with_env_filter(log_filter(directive)?)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(|_| Error::InvalidArgument("logging already initialised".into()))
}
