use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the global JSON log subscriber.
///
/// Every line is a single JSON object with `timestamp`, `level`, `stage` and
/// whatever fields the call site attaches. `RUST_LOG` filters as usual.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_env_filter(filter)
            .with_target(false)
            .init();
    });
}

/// Fallback trace id used when no caller-provided id is in scope.
pub const NO_TRACE: &str = "no-trace";

/// Fallback request id used when no caller-provided id is in scope.
pub const NO_REQUEST: &str = "no-request";

/// Generate a fresh hex trace id.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
