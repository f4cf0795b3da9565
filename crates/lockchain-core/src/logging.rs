//! Lightweight logging bootstrapper shared by every LockChain binary.

use env_logger::Env;
use serde_json::json;
use std::env;
use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "LOCKCHAIN_LOG_FORMAT";
const LEVEL_ENV: &str = "LOCKCHAIN_LOG_LEVEL";

/// Output encoding for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

impl LogFormat {
    /// Anything other than `plain` (case-insensitive) selects JSON.
    pub fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("plain") => LogFormat::Plain,
            _ => LogFormat::Json,
        }
    }
}

/// Initialise the global logger.
///
/// The first caller wins; later calls are no-ops. `RUST_LOG` takes precedence;
/// otherwise `LOCKCHAIN_LOG_LEVEL` or `default_level` sets the filter.
/// `LOCKCHAIN_LOG_FORMAT=plain` switches from JSON lines to text.
pub fn init(default_level: &str) {
    INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let format = LogFormat::from_setting(env::var(FORMAT_ENV).ok().as_deref());

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level));
    match format {
        LogFormat::Json => {
            builder.format(|buf, record| {
                let payload = json!({
                    "timestamp": buf.timestamp().to_string(),
                    "level": record.level().to_string().to_lowercase(),
                    "target": record.target(),
                    "message": record.args().to_string(),
                });
                writeln!(buf, "{payload}")
            });
        }
        LogFormat::Plain => {
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "{} {} {} - {}",
                    buf.timestamp(),
                    record.level().to_string().to_lowercase(),
                    record.target(),
                    record.args()
                )
            });
        }
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialise logger: {err}");
    }
}
