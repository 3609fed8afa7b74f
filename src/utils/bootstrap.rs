//! Process bootstrap for the `xmc` binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};

/// Filter used when `XMC_LOG` is unset.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "warn"
    }
}

/// True when `XMC_LOG_FORMAT` asks for JSON lines.
pub fn json_requested(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.eq_ignore_ascii_case("json"))
}

/// Initialize tracing from the `XMC_LOG` environment variable.
///
/// Logs go to stderr so stdout carries only message payloads. Defaults to
/// `warn`, or `debug` with `--verbose`.
pub fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));
    let json = json_requested(std::env::var(LOG_FORMAT_ENV_VAR).ok().as_deref());

    let registry = tracing_subscriber::registry().with(filter);
    // try_init: tests may initialize more than once.
    let _ = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
}
