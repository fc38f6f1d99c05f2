use env_logger::{Builder, Target};
use log::LevelFilter;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Directory under the local data dir that holds the server log
pub const LOG_DIR_NAME: &str = "UnityBridge";

/// Name of the log file written by the server
pub const LOG_FILE_NAME: &str = "unity_bridge_mcp.log";

/// Installs the global logger: stdout at debug level under `cargo test`, the log file otherwise.
/// Only the first call has an effect.
pub fn init_logging() {
    if cfg!(test) {
        init_test_logging();
    } else {
        init_file_logging();
    }
}

fn init_test_logging() {
    let _ = Builder::from_default_env()
        .target(Target::Stdout)
        .filter_level(LevelFilter::Debug)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}:{}] {}",
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .is_test(true)
        .try_init();
}

/// Logs to `<local data dir>/UnityBridge/unity_bridge_mcp.log`.
/// stdout carries the MCP stream, so if the file cannot be opened nothing is logged.
fn init_file_logging() {
    let log_file = log_directory().join(LOG_FILE_NAME);
    let file = match open_log_file(&log_file) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open log file {}: {}", log_file.display(), e);
            return;
        }
    };

    let installed = Builder::from_default_env()
        .target(Target::Pipe(Box::new(file)))
        .filter_level(LevelFilter::Info)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] [{}:{}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .try_init()
        .is_ok();

    if installed {
        log::info!("Logging initialized to file: {}", log_file.display());
    }
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::OpenOptions::new().create(true).append(true).open(path)
}

fn log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(LOG_DIR_NAME)
}

/// Macro for debug logging that replaces println! for debug messages
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}

/// Macro for info logging
#[macro_export]
macro_rules! info_log {
    ($($arg:tt)*) => {
        log::info!($($arg)*)
    };
}

/// Macro for warning logging
#[macro_export]
macro_rules! warn_log {
    ($($arg:tt)*) => {
        log::warn!($($arg)*)
    };
}

/// Macro for error logging
#[macro_export]
macro_rules! error_log {
    ($($arg:tt)*) => {
        log::error!($($arg)*)
    };
}
