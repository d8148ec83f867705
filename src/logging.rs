use std::env;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Log level filter (e.g., "debug", "info", "warn", "error")
    pub level: String,
    /// Optional log file path. If None, logs only to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to use structured JSON format for logs
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Create LogConfig from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let level = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());

        let unique = lookup("INDEX_BUILDER_LOG_UNIQUE").unwrap_or_default() == "true";
        let file_path = lookup("INDEX_BUILDER_LOG_FILE").map(|path| {
            let path = PathBuf::from(path);
            if unique {
                unique_log_path(&path, std::process::id())
            } else {
                path
            }
        });

        let json_format = lookup("INDEX_BUILDER_LOG_JSON").unwrap_or_default() == "true";

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// Insert the process id before the extension: `builds.log` -> `builds.<pid>.log`
fn unique_log_path(path: &Path, pid: u32) -> PathBuf {
    let Some(stem) = path.file_stem() else {
        return path.to_path_buf();
    };
    let unique = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if !ext.is_empty() => format!("{}.{}.{}", stem.to_string_lossy(), pid, ext),
        _ => format!("{}.{}", stem.to_string_lossy(), pid),
    };
    path.with_file_name(unique)
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(file_path), true) => {
            let file_layer = fmt::layer()
                .json()
                .with_writer(open_log_file(file_path)?)
                .with_ansi(false);

            subscriber.with(file_layer).init();
        }
        (Some(file_path), false) => {
            let file_layer = fmt::layer()
                .with_writer(open_log_file(file_path)?)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            subscriber.with(file_layer).init();
        }
        (None, true) => {
            let stderr_layer = fmt::layer().json().with_writer(io::stderr).with_ansi(false);

            subscriber.with(stderr_layer).init();
        }
        // Stderr only + human readable format (default)
        (None, false) => {
            let stderr_layer = fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            subscriber.with(stderr_layer).init();
        }
    }

    Ok(())
}

/// Log one index build transition as a single structured line
#[macro_export]
macro_rules! log_build_event {
    ($level:expr, $build:expr, $event:expr) => {
        tracing::event!(
            $level,
            build = %$build,
            event = $event,
            "Index build event"
        );
    };
    ($level:expr, $build:expr, $event:expr, $detail:expr) => {
        tracing::event!(
            $level,
            build = %$build,
            event = $event,
            detail = %$detail,
            "Index build event"
        );
    };
}

/// Helper function to log performance timing
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            pid = std::process::id(),
            "Performance timing"
        );
    };
}
