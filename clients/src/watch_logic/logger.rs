use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

const LOG_PREFIX: &str = "parking_watch_";

pub fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<PathBuf> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Keep only the most recent previous run next to the new file
    cleanup_old_logs(log_dir, 1)?;

    let log_file_name = format!("{}{}.log", LOG_PREFIX, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(log_level))
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path)?)
        .apply()?;

    Ok(log_path)
}

/// Deletes all but the `keep` newest `parking_watch_*.log` files in
/// `log_dir`. Returns how many were deleted.
pub fn cleanup_old_logs(log_dir: &Path, keep: usize) -> Result<usize> {
    let pattern = log_dir.join(format!("{}*.log", LOG_PREFIX));
    let mut entries: Vec<(PathBuf, std::time::SystemTime)> = glob::glob(&pattern.to_string_lossy())?
        .filter_map(|res| res.ok())
        .filter_map(|path| {
            let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((path, modified))
        })
        .collect();

    // Newest first
    entries.sort_by_key(|(_, modified)| std::cmp::Reverse(*modified));

    let mut removed = 0;
    for (path, _) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }

    Ok(removed)
}
