use log::{error, info, LevelFilter};
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        rolling_file::{
            policy::compound::{
                roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
            },
            RollingFileAppender,
        },
    },
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
};
use std::{env::var, path::Path, sync::LazyLock};

use crate::error::LoggerError;

const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;
const KEPT_ARCHIVES: u32 = 10;
const LINE_FORMAT: &str = "{d} {l} {t} - {m}{n}";

/// Directory holding `alarm.log` and its archives.
pub static LOG_DIR: LazyLock<String> =
    LazyLock::new(|| var("ALARM_LOG_DIR").unwrap_or("data/logs".to_string()));

/// Root level from `LOG_LEVEL`, `debug` when unset or unparsable. The console
/// never shows less than `info`.
fn root_level() -> LevelFilter {
    var("LOG_LEVEL")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(LevelFilter::Debug)
}

fn alarm_log(dir: &Path) -> Result<RollingFileAppender, LoggerError> {
    let active = dir.join("alarm.log");
    let archives = dir.join("alarm.{}.log");
    let roller = FixedWindowRoller::builder()
        .build(&archives.to_string_lossy(), KEPT_ARCHIVES)
        .map_err(|e| LoggerError::Roller(e.to_string()))?;
    let policy = CompoundPolicy::new(
        Box::new(SizeTrigger::new(ROTATE_AT_BYTES)),
        Box::new(roller),
    );
    let appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LINE_FORMAT)))
        .append(true)
        .build(active, Box::new(policy))?;
    Ok(appender)
}

fn logger_config(dir: &Path, level: LevelFilter) -> Result<Config, LoggerError> {
    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LINE_FORMAT)))
        .build();
    Config::builder()
        .appender(Appender::builder().build("alarm_log", Box::new(alarm_log(dir)?)))
        .appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(LevelFilter::Info)))
                .build("console", Box::new(console)),
        )
        .build(
            Root::builder()
                .appender("alarm_log")
                .appender("console")
                .build(level),
        )
        .map_err(|e| LoggerError::Config(e.to_string()))
}

pub fn init_logger() -> Result<(), LoggerError> {
    let level = root_level();
    let config = logger_config(Path::new(LOG_DIR.as_str()), level)?;
    match log4rs::init_config(config) {
        Ok(_) => {
            info!("Logging to {} at level {}", LOG_DIR.as_str(), level);
            Ok(())
        }
        Err(e) => {
            error!("Failed to initialize logger: {}", e);
            Err(e.into())
        }
    }
}
