//! Tracing setup for binaries and tests that embed the crate.
//!
//! [`init`] installs a `tracing-subscriber` fmt layer filtered by `RUST_LOG`
//! (falling back to the given directive). With the `profiling` feature a
//! Chrome trace layer is stacked on top and written to `trace.json`; open it
//! in `chrome://tracing` or [Perfetto](https://ui.perfetto.dev). The decode
//! loops emit `info_span!`s per step only when that feature is on.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the trace file open; hold it until the program exits.
#[cfg(feature = "profiling")]
pub struct LoggingGuard {
    _chrome: tracing_chrome::FlushGuard,
}

/// Zero-size stand-in when profiling is compiled out.
#[cfg(not(feature = "profiling"))]
pub struct LoggingGuard;

/// Install the global subscriber.
///
/// `default_directive` is used when `RUST_LOG` is unset, e.g. `"valle=info"`.
/// Returns an error if a global subscriber is already installed.
pub fn init(default_directive: &str) -> anyhow::Result<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))?;
    let fmt = tracing_subscriber::fmt::layer().with_target(true);

    #[cfg(feature = "profiling")]
    {
        let (chrome, guard) = tracing_chrome::ChromeLayerBuilder::new()
            .file("trace.json")
            .include_args(true)
            .build();
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .with(chrome)
            .try_init()?;
        tracing::info!("profiling enabled, trace will be written to trace.json");
        Ok(LoggingGuard { _chrome: guard })
    }

    #[cfg(not(feature = "profiling"))]
    {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .try_init()?;
        Ok(LoggingGuard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_only_once() {
        let _guard = init("valle=debug").unwrap();
        tracing::debug!("subscriber installed");
        assert!(init("valle=info").is_err());
    }
}
