use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

/// Map verbosity count to tracing level
#[must_use]
pub const fn verbosity_level(verbosity: u8) -> tracing::Level {
    match verbosity {
        0 => tracing::Level::ERROR,
        1 => tracing::Level::WARN,
        2 => tracing::Level::INFO,
        3 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the level.
/// # Errors
/// Returns an error if a global subscriber is already installed.
pub fn init(level: tracing::Level, json: bool) -> Result<()> {
    let fmt_layer = if json {
        fmt::layer()
            .json()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    // RUST_LOG=
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = Registry::default().with(fmt_layer).with(env_filter);

    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_level() {
        assert_eq!(verbosity_level(0), tracing::Level::ERROR);
        assert_eq!(verbosity_level(2), tracing::Level::INFO);
        assert_eq!(verbosity_level(4), tracing::Level::TRACE);
        assert_eq!(verbosity_level(9), tracing::Level::TRACE);
    }
}
