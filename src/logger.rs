use chrono::Utc;
use colored::*;
use log::{Level, Metadata, Record};
use once_cell::sync::Lazy;
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::{Duration, Instant};

static GATEWAY_LOGGER: Lazy<GatewayLogger> = Lazy::new(GatewayLogger::new);

pub fn init() -> Result<(), String> {
    init_with_config(LoggerConfig::default())
}

pub fn init_with_config(config: LoggerConfig) -> Result<(), String> {
    GATEWAY_LOGGER.update_config(config.clone());

    if let Err(e) = log::set_logger(&*GATEWAY_LOGGER) {
        return Err(format!("Failed to set logger: {:?}", e));
    }

    log::set_max_level(config.min_level.to_log_level_filter());
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    pub fn color(&self) -> Color {
        match self {
            LogLevel::Trace => Color::Cyan,
            LogLevel::Debug => Color::Blue,
            LogLevel::Info => Color::Green,
            LogLevel::Warn => Color::Yellow,
            LogLevel::Error => Color::Red,
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            LogLevel::Trace => "🔍",
            LogLevel::Debug => "🐛",
            LogLevel::Info => "💡",
            LogLevel::Warn => "⚠️",
            LogLevel::Error => "❌",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    pub fn to_log_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::Trace,
            LogLevel::Debug => Level::Debug,
            LogLevel::Info => Level::Info,
            LogLevel::Warn => Level::Warn,
            LogLevel::Error => Level::Error,
        }
    }

    pub fn to_log_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }

    pub fn from_log_level(level: Level) -> Self {
        match level {
            Level::Trace => LogLevel::Trace,
            Level::Debug => LogLevel::Debug,
            Level::Info => LogLevel::Info,
            Level::Warn => LogLevel::Warn,
            Level::Error => LogLevel::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub show_colors: bool,
    pub show_emojis: bool,
    pub show_module: bool,
    pub include_timestamp: bool,
    pub timestamp_format: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            show_colors: true,
            show_emojis: true,
            show_module: true,
            include_timestamp: true,
            timestamp_format: "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        }
    }
}

impl LoggerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn with_colors(mut self, enabled: bool) -> Self {
        self.show_colors = enabled;
        self
    }

    pub fn production() -> Self {
        Self {
            min_level: LogLevel::Info,
            show_colors: false,
            show_emojis: false,
            ..Default::default()
        }
    }

    pub fn development() -> Self {
        Self {
            min_level: LogLevel::Debug,
            show_colors: true,
            show_emojis: true,
            ..Default::default()
        }
    }
}

pub struct GatewayLogger {
    config: Mutex<LoggerConfig>,
}

impl GatewayLogger {
    pub fn new() -> Self {
        Self {
            config: Mutex::new(LoggerConfig::default()),
        }
    }

    pub fn update_config(&self, new_config: LoggerConfig) {
        let mut config = self.config.lock().unwrap();
        *config = new_config;
    }

    fn format_line(&self, record: &Record, config: &LoggerConfig) -> String {
        let level = LogLevel::from_log_level(record.level());
        let mut output = String::new();

        if config.include_timestamp {
            let timestamp = Utc::now().format(&config.timestamp_format).to_string();
            if config.show_colors {
                output.push_str(&format!("{} ", timestamp.bright_black()));
            } else {
                output.push_str(&format!("{} ", timestamp));
            }
        }

        let level_str = if config.show_emojis {
            format!("{} {}", level.emoji(), level.as_str())
        } else {
            level.as_str().to_string()
        };
        if config.show_colors {
            output.push_str(&format!("[{}] ", level_str.color(level.color()).bold()));
        } else {
            output.push_str(&format!("[{}] ", level_str));
        }

        if config.show_module {
            let module = record.module_path().unwrap_or("unknown");
            if config.show_colors {
                output.push_str(&format!("{}::", module.bright_blue()));
            } else {
                output.push_str(&format!("{}::", module));
            }
        }

        output.push_str(&record.args().to_string());
        output
    }
}

impl log::Log for GatewayLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if let Ok(config) = self.config.lock() {
            metadata.level() <= config.min_level.to_log_level()
        } else {
            true
        }
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            if let Ok(config) = self.config.lock() {
                println!("{}", self.format_line(record, &config));
            }
        }
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
    }
}

/// Timer for measuring the duration of an upstream call; logs on drop.
pub struct Timer {
    start: Instant,
    name: String,
}

impl Timer {
    pub fn new(name: &str) -> Self {
        Self {
            start: Instant::now(),
            name: name.to_string(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        log::info!(
            "⏱️  '{}' completed in {}ms",
            self.name,
            self.elapsed().as_millis()
        );
    }
}

pub fn timer(name: &str) -> Timer {
    Timer::new(name)
}

pub fn log_startup_info(app_name: &str, version: &str, port: u16) {
    log::info!("🚀 Starting {} v{}", app_name, version);
    log::info!("🌐 Server will run on http://0.0.0.0:{}", port);
}

pub fn log_config_info(config: &crate::config::Config) {
    log::info!("⚙️  Configuration loaded:");
    log::info!("   Port: {}", config.port.unwrap_or(8000));
    log::info!("   Base models: {}", config.base_models.join(", "));
    log::info!(
        "   AI server: {}",
        config
            .ai_server
            .as_ref()
            .and_then(|c| c.url.as_deref())
            .unwrap_or("not configured")
    );
    log::info!(
        "   S3 storage: {}",
        if config.s3.as_ref().map(|c| c.is_complete()).unwrap_or(false) {
            "✅"
        } else {
            "❌"
        }
    );
    log::info!(
        "   Training launcher: {}",
        config.training.launcher.as_deref().unwrap_or("not configured")
    );
}
