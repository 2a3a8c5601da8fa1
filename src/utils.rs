use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn app_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("app", "outfit-palette", "outfit-palette")
}

/// Per-user cache directory when one can be resolved, the system temp dir otherwise.
pub fn default_upload_dir() -> PathBuf {
    app_dirs()
        .map(|dirs| dirs.cache_dir().join("uploads"))
        .unwrap_or_else(|| std::env::temp_dir().join("outfit-palette-uploads"))
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))
}

pub fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

pub fn timestamp_millis() -> i128 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000
}

/// Install the global subscriber: stdout always, plus a daily rolling file when
/// `log_dir` is given. Keep the returned guard alive for the life of the process.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer());

    match log_dir {
        Some(dir) => {
            ensure_dir(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "outfit-palette.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .try_init()
                .context("install tracing subscriber")?;
            Ok(Some(guard))
        }
        None => {
            registry.try_init().context("install tracing subscriber")?;
            Ok(None)
        }
    }
}
