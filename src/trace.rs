use std::sync::Once;

use tracing::Instrument;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::settings::LogFormat;

static INIT: Once = Once::new();

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber once. `RUST_LOG` controls filtering and
/// `log_format` picks compact text or JSON lines.
///
/// Later calls are no-ops, and an already-installed subscriber (for example one
/// set up by the host application) is left in place.
pub fn init(log_format: LogFormat) {
    INIT.call_once(|| {
        let env_filter = build_env_filter();
        let registry = tracing_subscriber::registry();
        let result = match log_format {
            LogFormat::Text => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .compact()
                        .with_filter(env_filter),
                )
                .try_init(),
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .json()
                        .with_filter(env_filter),
                )
                .try_init(),
        };
        if let Err(err) = result {
            eprintln!("tracing subscriber already installed: {err}");
        }
    });
}

/// Run an async test body inside a span named after the test.
pub async fn with_test_tracing<F, Fut, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    init(LogFormat::Text);
    let span = tracing::info_span!("test", name = test_name);
    f().instrument(span).await
}

/// Synchronous counterpart of [`with_test_tracing`].
pub fn with_test_tracing_sync<F, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    init(LogFormat::Text);
    let span = tracing::info_span!("test", name = test_name);
    let _entered = span.enter();
    f()
}
