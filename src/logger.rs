// Logging setup: console layer always, file layer when LOG_FILE is set.
// Filter resolution: RUST_LOG, then LOG_LEVEL, then the server mode
// (debug mode lowers the default from info to debug).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct Rfc3339Timer;

impl fmt::time::FormatTime for Rfc3339Timer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Utc::now().to_rfc3339())
    }
}

fn default_filter() -> String {
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        if !level.trim().is_empty() {
            return level;
        }
    }
    let debug_mode = std::env::var("SERVER_MODE")
        .map(|m| m.eq_ignore_ascii_case("debug"))
        .unwrap_or(false);
    if debug_mode {
        "kiro_relay=debug,info".to_string()
    } else {
        "info".to_string()
    }
}

pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter()));

    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_level(true)
        .with_timer(Rfc3339Timer);

    let registry = tracing_subscriber::registry().with(filter).with(console_layer);

    match std::env::var("LOG_FILE").ok().filter(|p| !p.trim().is_empty()) {
        Some(path) => {
            let path = std::path::PathBuf::from(path);
            let dir = path.parent().unwrap_or(std::path::Path::new(".")).to_path_buf();
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "kiro-relay.log".to_string());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            // The guard must outlive the process for the writer to flush.
            std::mem::forget(guard);

            let file_layer = fmt::Layer::new()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_timer(Rfc3339Timer);
            let _ = registry.with(file_layer).try_init();
        }
        None => {
            let _ = registry.try_init();
        }
    }
}
