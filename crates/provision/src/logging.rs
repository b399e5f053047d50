use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the trace filter (e.g. `debug`,
/// `appliance_provision=trace`).
pub const FILTER_ENV: &str = "PROVISION_LOG";

/// Route `tracing` events to the trace log.
///
/// Fails instead of panicking when the log cannot be opened, e.g. a
/// `trace.log` left root-owned by an earlier sudo run.
///
/// The returned guard must stay alive until the process is about to exit or
/// reboot; dropping it flushes buffered events.
pub fn init(trace_log: &Path) -> std::io::Result<WorkerGuard> {
    let dir = trace_log.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let file_name = trace_log
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "trace.log".into());

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(dir)
        .map_err(std::io::Error::other)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let env_filter =
        EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false),
        )
        .try_init();

    Ok(guard)
}
