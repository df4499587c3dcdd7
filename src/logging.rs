use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

pub fn init_stdout(max_level: Level) {
    init(max_level, LogFormat::Text);
}

pub fn init(max_level: Level, format: LogFormat) {
    let filter = LevelFilter::from_level(max_level);
    let layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_thread_names(true);
    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(layer.json().with_filter(filter))
            .init(),
    }
}

/// Verbosity flag count to a level, starting from `INFO`
pub fn level_from_verbosity(verbosity: usize) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}
