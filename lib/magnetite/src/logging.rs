pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Build the default terminal logger.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger config");

    config.build_logger().expect("Error building logger")
}

/// Child logger stamping flow identification on every record.
pub fn flow(log: &Logger, flow_id: u64, flow_version: u8) -> Logger {
    log.new(o!("flow_id" => format!("{:016x}", flow_id), "flow_version" => flow_version))
}

/// Resolves the optional parent logger used by component constructors,
/// falling back to a discard logger.
pub fn component<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => Logger::root(Discard, o!()),
    }
}
