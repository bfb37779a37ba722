use tracing_subscriber::EnvFilter;

pub const DEFAULT_LEVEL: &str = "info";

/// Pick the filter directive: an explicit level from the command line wins
/// over the configuration file, which wins over the default.
pub fn directive(cli_level: Option<&str>, config_level: Option<&str>) -> String {
    cli_level
        .or(config_level)
        .unwrap_or(DEFAULT_LEVEL)
        .to_string()
}

/// Install the global subscriber. `RUST_LOG`, when set, overrides `directive`.
pub fn init(directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL));

    // A second init (tests) is harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
