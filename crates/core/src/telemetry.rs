use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is absent: our crates at `info`, the SQL
/// driver only when something goes wrong.
const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn,alloy_transport=warn";

/// Initialise the global tracing subscriber for a named process.
///
/// Respects `RUST_LOG`. Calling it twice is harmless; the second call keeps
/// the subscriber installed first.
pub fn init(process: &'static str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(process, "tracing initialised");
    }
}
