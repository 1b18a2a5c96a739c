use log::LevelFilter;

/// Initializes the process logger. `RUST_LOG` takes precedence over the
/// level given on the command line.
pub fn init_log(level: Option<LevelFilter>) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level.unwrap_or(LevelFilter::Info));
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.format_timestamp_millis();
    if let Err(e) = builder.try_init() {
        eprintln!("Logger already initialized, {}", e);
    }
}
