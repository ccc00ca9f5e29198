use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use log::LevelFilter;

use crate::cli::OperationMode;

const PATTERN: &str = "{d(%Y-%m-%dT%H:%M:%S%.6f)} [{l}] {t} - {m}{n}";

pub fn init_logging(mode: OperationMode, log_file: &str, level_override: Option<LevelFilter>) -> Result<log4rs::Handle, String> {
    let level = level_override.unwrap_or(match mode {
        OperationMode::Dev => LevelFilter::Trace,
        OperationMode::Prod => LevelFilter::Info,
    });

    let console = ConsoleAppender::builder().encoder(Box::new(PatternEncoder::new(PATTERN))).build();

    let file = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .append(mode == OperationMode::Prod)
        .build(log_file)
        .map_err(|e| format!("failed to open log file {}: {}", log_file, e))?;

    let config = Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)))
        .appender(Appender::builder().build("file", Box::new(file)))
        .logger(Logger::builder().build("runway", level))
        .build(
            Root::builder()
                .appender("console")
                .appender("file")
                .build(level),
        )
        .map_err(|e| format!("failed to build logging configuration: {}", e))?;

    log4rs::init_config(config).map_err(|e| format!("failed to initialize logging: {}", e))
}
