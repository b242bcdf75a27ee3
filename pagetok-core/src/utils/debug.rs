use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Set `PAGETOK_DEBUG=1` to log at debug level by default.
pub const DEBUG_ENV_VAR: &str = "PAGETOK_DEBUG";

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` directives take precedence over the default level. Calling this
/// more than once, or after another subscriber was installed, is a no-op.
pub fn initialize_logging() {
    let is_debug = std::env::var(DEBUG_ENV_VAR)
        .unwrap_or_default()
        .contains('1');

    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
