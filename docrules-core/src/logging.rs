use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

use crate::errors::{DocRulesError, Result};

/// Output layout for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-field human readable lines (default).
    #[default]
    Full,
    /// Single-line compact output, used by the CLI.
    Compact,
}

/// Initializes the tracing subscriber shared by the docrules binaries.
///
/// `RUST_LOG` wins over `level` when set.
pub fn init_tracing(level: Option<&str>, format: LogFormat) -> Result<()> {
    let default_level = level.unwrap_or("info");
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(atty::is(atty::Stream::Stdout));

    let installed = match format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };

    installed.map_err(|err| DocRulesError::General(err.to_string()))
}
