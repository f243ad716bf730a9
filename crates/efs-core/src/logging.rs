//! Logging bootstrap shared by every binary.

use env_logger::{Builder, Env};

/// Environment variable that overrides the default filter.
pub const LOG_FILTER_ENV: &str = "EFS_LOG";

/// Install the `env_logger` backend once; later calls are no-ops.
pub fn init(default_filter: &str) {
    let env = Env::default()
        .filter_or(LOG_FILTER_ENV, default_filter)
        .write_style_or("EFS_LOG_STYLE", "auto");
    let _ = Builder::from_env(env)
        .format_timestamp_secs()
        .format_target(false)
        .try_init();
}
