//! Logger initialisation for the binaries

use log::LevelFilter;

/// Environment variable holding `env_logger` filters; overrides `-v`
pub const LOG_ENV: &str = "BLE_BRIDGE_LOG";

/// Log target shared by the library and the binary
const CRATE_TARGET: &str = "ble_serial_bridge";

/// Map a `-v` count to a level: none is info, one is debug, more is trace.
pub fn level_for_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Initialise `env_logger`.
///
/// Only this crate's modules follow the verbosity; dependencies stay at warn
/// unless `BLE_BRIDGE_LOG` says otherwise.
pub fn init_logging(verbosity: u8) {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(LevelFilter::Warn)
        .filter_module(CRATE_TARGET, level_for_verbosity(verbosity))
        .format_timestamp_millis();

    if let Ok(filters) = std::env::var(LOG_ENV) {
        builder.parse_filters(&filters);
    }

    // A second init (tests, embedding) keeps the first logger
    let _ = builder.try_init();
}
