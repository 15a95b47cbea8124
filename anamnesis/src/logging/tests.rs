use crate::config::{LogFormat, LogLevel, LoggingConfig};
use crate::logging::{LogError, init, level_to_log_level, parse_log_level};
use std::sync::Once;

// Only one global subscriber can be installed per test binary
static INIT: Once = Once::new();

#[test]
fn test_init_console_logging() {
    INIT.call_once(|| {
        let config = LoggingConfig {
            level: LogLevel::Debug,
            format: LogFormat::Compact,
            file: None,
            stdout: true,
        };
        assert!(init(&config).is_ok());
    });

    // A second initialization is tolerated
    let guard = init(&LoggingConfig::default()).unwrap();
    assert!(!guard.writes_file());
}

#[test]
fn test_level_conversion() {
    assert_eq!(parse_log_level("trace").unwrap(), LogLevel::Trace);
    assert_eq!(parse_log_level("DEBUG").unwrap(), LogLevel::Debug);
    assert_eq!(parse_log_level("info").unwrap(), LogLevel::Info);
    assert_eq!(parse_log_level("warn").unwrap(), LogLevel::Warn);
    assert_eq!(parse_log_level("error").unwrap(), LogLevel::Error);
    assert!(matches!(
        parse_log_level("invalid"),
        Err(LogError::InvalidLogLevel(level)) if level == "invalid"
    ));

    assert_eq!(level_to_log_level(tracing::Level::TRACE), LogLevel::Trace);
    assert_eq!(level_to_log_level(tracing::Level::DEBUG), LogLevel::Debug);
    assert_eq!(level_to_log_level(tracing::Level::INFO), LogLevel::Info);
    assert_eq!(level_to_log_level(tracing::Level::WARN), LogLevel::Warn);
    assert_eq!(level_to_log_level(tracing::Level::ERROR), LogLevel::Error);
}

#[test]
fn test_log_error_display() {
    let err = LogError::InvalidLogLevel("loud".to_string());
    assert_eq!(err.to_string(), "Invalid log level: loud");
}
