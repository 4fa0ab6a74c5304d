use env_logger::{Builder, Target};
use log::{Level, LevelFilter, SetLoggerError};
use std::env;
use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub fn init_logging() -> Result<(), SetLoggerError> {
    let env = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let log_level = match env.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    let mut builder = Builder::from_default_env();

    builder.format(|buf, record| {
        let timestamp = buf.timestamp();
        let target = record.target();
        let file = record.file().unwrap_or("unknown");
        let line = record.line().unwrap_or(0);

        match record.level() {
            Level::Info => {
                writeln!(buf, "{} [INFO] [{}]: {}", timestamp, target, record.args())
            }
            level => {
                writeln!(
                    buf,
                    "{} [{}] [{}:{}] {}: {}",
                    timestamp, level, file, line, target, record.args()
                )
            }
        }
    });

    // Filter out noisy modules in production
    if env::var("RUST_ENV").unwrap_or_else(|_| "development".to_string()) == "production" {
        builder.filter_module("reqwest", LevelFilter::Warn);
        builder.filter_module("hyper", LevelFilter::Warn);
        builder.filter_module("sqlx", LevelFilter::Warn);
    }

    builder
        .filter_level(log_level)
        .target(Target::Stdout)
        .init();
    Ok(())
}

pub fn log_token_refresh(provider: &str, integration_id: i64, outcome: &str) {
    log::info!(
        "[Token] refresh for {} integration {}: {}",
        provider,
        integration_id,
        outcome
    );
}

pub fn log_fetch_failure(provider: &str, calendar_id: &str, error: &crate::error::SyncError) {
    log::warn!(
        "[Fetch] calendar '{}' on {} failed ({}): {}",
        calendar_id,
        provider,
        error.class(),
        error
    );
}

pub fn log_health_transition(
    provider: &str,
    integration_id: i64,
    transition: &crate::health::StatusTransition,
) {
    log::warn!(
        "[Health] {} integration {}: {:?} ({:?} -> {:?})",
        provider,
        integration_id,
        transition.kind,
        transition.previous,
        transition.current
    );
}

/// Emits at most one message per `min_interval`, swallowing the rest.
///
/// Used where a misconfigured integration would otherwise repeat the
/// same warning on every booking request. Injected at the call site
/// rather than living in process-global state, so tests can construct
/// their own.
#[derive(Debug)]
pub struct RateLimitedLogger {
    min_interval: Duration,
    last_emitted: Mutex<Option<Instant>>,
}

impl RateLimitedLogger {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emitted: Mutex::new(None),
        }
    }

    /// One message per minute, the cadence the booking path uses.
    pub fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    pub fn warn(&self, message: &str) {
        if self.should_emit() {
            log::warn!("{}", message);
        }
    }

    fn should_emit(&self) -> bool {
        let mut last = self
            .last_emitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *last {
            Some(at) if at.elapsed() < self.min_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_logger_suppresses_within_interval() {
        let limiter = RateLimitedLogger::new(Duration::from_secs(60));
        assert!(limiter.should_emit());
        assert!(!limiter.should_emit());
        assert!(!limiter.should_emit());
    }

    #[test]
    fn test_rate_limited_logger_emits_after_interval() {
        let limiter = RateLimitedLogger::new(Duration::from_millis(10));
        assert!(limiter.should_emit());
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.should_emit());
    }
}
