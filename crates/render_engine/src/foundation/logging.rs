//! Logging utilities

pub use log::{debug, info, warn, error, trace};

/// Initialize the logging system from `RUST_LOG`
pub fn init() {
    env_logger::init();
}

/// Initialize logging with a default level filter that `RUST_LOG` can still override.
///
/// Fails when a logger is already installed.
pub fn init_with_level(level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .parse_default_env()
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_rejected() {
        let _ = init_with_level(log::LevelFilter::Debug);
        assert!(init_with_level(log::LevelFilter::Info).is_err());
    }
}
