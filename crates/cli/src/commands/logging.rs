use std::env;
use std::sync::Once;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Map the `-v` count to a level: warn, info, debug, then trace.
pub fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install the stderr subscriber once. `RUST_LOG`, when set, wins over `-v`.
pub fn init_logging(verbosity: u8) {
    INIT.call_once(|| {
        let level = level_for(verbosity);
        let mut filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            for crate_name in ["probe_core", "feature_probe"] {
                if let Ok(directive) = format!("{crate_name}={level}").parse() {
                    filter = filter.add_directive(directive);
                }
            }
        }

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    });
}
