use std::str::FromStr;
use std::sync::Once;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    HumanReadable,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "human" | "human_readable" => Ok(LogFormat::HumanReadable),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

static INIT: Once = Once::new();

/// Configure the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `default_level`. Only the first call has
/// any effect, later calls (e.g. from multiple tests) are ignored.
pub fn configure_global_logger(default_level: LevelFilter, format: LogFormat) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy();

        let builder = FmtSubscriber::builder()
            .with_env_filter(env_filter)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true);

        // Another subscriber may already be installed by the embedding
        // process. That's not an error for us.
        let _ = match format {
            LogFormat::HumanReadable => {
                tracing::subscriber::set_global_default(builder.finish())
            }
            LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
        };
    })
}

/// Parse a level name such as "info" or "debug", falling back to INFO.
pub fn parse_level(s: &str) -> LevelFilter {
    LevelFilter::from_str(s.trim()).unwrap_or(LevelFilter::INFO)
}
