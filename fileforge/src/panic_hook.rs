//! Process-wide panic reporting.
//!
//! Panics inside conversion tasks are caught by the orchestrator and turned
//! into failed jobs; this hook makes sure every panic is also logged with its
//! location and backtrace. Panics on the main thread end the process before
//! the non-blocking log writer flushes, so those are appended to the current
//! log file directly as well.

use std::backtrace::Backtrace;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{PanicHookInfo, take_hook};
use std::path::{Path, PathBuf};
use std::thread;

use chrono::Local;

use crate::logging::LOG_FILE_PREFIX;

/// Install the hook. The previous hook still runs afterwards.
pub fn install(log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref().to_path_buf();
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = format_panic_record(panic_info);
            tracing::error!(target: "fileforge::panic", "{record}");

            if thread::current().name() == Some("main") {
                let _ = append_panic_record(&log_dir, &record);
            }
        }));

        previous_hook(panic_info);
    }));
}

fn append_panic_record(log_dir: &Path, record: &str) -> std::io::Result<()> {
    let filename = format!("{}.{}", LOG_FILE_PREFIX, Local::now().format("%Y-%m-%d"));
    let path = PathBuf::from(log_dir).join(filename);

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{record}")?;
    file.flush()
}

fn format_panic_record(panic_info: &PanicHookInfo<'_>) -> String {
    let payload = panic_payload(panic_info);
    let location = panic_info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "<unknown>".to_string());
    let thread_name = thread::current()
        .name()
        .unwrap_or("<unnamed>")
        .to_string();
    let ts = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");

    format!(
        "{ts} PANIC thread={thread_name} location={location} payload={payload}\nBacktrace:\n{}",
        Backtrace::force_capture()
    )
}

fn panic_payload(panic_info: &PanicHookInfo<'_>) -> String {
    let payload = panic_info.payload();
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        panic_info.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_panic_record_uses_daily_log_name() {
        let dir = TempDir::new().unwrap();
        append_panic_record(dir.path(), "PANIC test").unwrap();

        let expected = dir
            .path()
            .join(format!("{}.{}", LOG_FILE_PREFIX, Local::now().format("%Y-%m-%d")));
        let contents = std::fs::read_to_string(expected).unwrap();
        assert!(contents.contains("PANIC test"));
    }
}
