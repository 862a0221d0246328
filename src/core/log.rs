use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    EnvFilter, fmt, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

/// Environment variable holding the default log level.
pub const LOG_LEVEL_ENV: &str = "PIPELINE_LOG_LEVEL";

const CRATE_TARGET: &str = "siglo_fundos";

pub fn init_logging(verbose: bool) {
    let filter = log_filter(
        verbose,
        std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(),
        std::env::var(LOG_LEVEL_ENV).ok().as_deref(),
    );

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// `RUST_LOG` directives replace the `PIPELINE_LOG_LEVEL` level outright;
/// `--verbose` then adds debug for this crate.
fn log_filter(verbose: bool, rust_log: Option<&str>, level: Option<&str>) -> EnvFilter {
    let base = match rust_log.map(str::trim).filter(|d| !d.is_empty()) {
        Some(directives) => directives.to_string(),
        None => level
            .and_then(|l| l.trim().parse::<LevelFilter>().ok())
            .unwrap_or(LevelFilter::INFO)
            .to_string(),
    };
    let directives = if verbose {
        format!("{base},{CRATE_TARGET}=debug")
    } else {
        base
    };
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"))
}
