use std::sync::Once;

use tracing_subscriber::EnvFilter;

const FALLBACK_FILTER: &str = "huddle_core=info";

/// Initialize tracing/logging. Call once from the host before building a surface.
///
/// `RUST_LOG` wins over `default_filter`; an unparsable filter falls back to
/// `huddle_core=info`. Later calls are no-ops.
pub fn init_logging(default_filter: &str) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_filter))
            .unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER));
        // Another subscriber may already be installed by the host.
        if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).with_ansi(false).try_init() {
            eprintln!("huddle-core: logging not initialized: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_logging("huddle_core=debug");
        init_logging("not a [valid filter");
        tracing::info!("logging initialized");
    }
}
