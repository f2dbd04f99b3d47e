use chrono::Local;
use std::backtrace::Backtrace;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

static LOG_FILE: OnceLock<Mutex<File>> = OnceLock::new();

const LOG_ROTATE_KEEP: usize = 5;
const CRASH_LOG_KEEP: usize = 5;

pub fn data_dir() -> Result<PathBuf, String> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("LycheeTalk"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".lycheetalk"));
    }
    Err("Failed to resolve LycheeTalk data directory".into())
}

pub fn logs_dir() -> Result<PathBuf, String> {
    Ok(data_dir()?.join("logs"))
}

pub fn init_session_logging() -> Result<PathBuf, String> {
    let dir = logs_dir()?;
    fs::create_dir_all(&dir).map_err(|e| format!("Failed to create logs dir: {}", e))?;
    rotate_logs(&dir)?;
    let active = dir.join("app.log");
    let file = File::options()
        .create(true)
        .append(true)
        .open(&active)
        .map_err(|e| format!("Failed to open app log: {}", e))?;
    let _ = LOG_FILE.set(Mutex::new(file));
    append_line(
        "INFO",
        &format!(
            "session_start version={} ts={}",
            env!("CARGO_PKG_VERSION"),
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ),
    );
    Ok(active)
}

fn rotate_logs(dir: &Path) -> Result<(), String> {
    for i in (1..LOG_ROTATE_KEEP).rev() {
        let from = dir.join(format!("app.{}.log", i));
        let to = dir.join(format!("app.{}.log", i + 1));
        if from.exists() {
            let _ = fs::remove_file(&to);
            fs::rename(&from, &to).map_err(|e| format!("Failed to rotate log {}: {}", i, e))?;
        }
    }
    let active = dir.join("app.log");
    if active.exists() {
        let to = dir.join("app.1.log");
        let _ = fs::remove_file(&to);
        fs::rename(&active, &to).map_err(|e| format!("Failed to rotate active log: {}", e))?;
    }
    prune_crash_logs(dir, CRASH_LOG_KEEP)?;
    Ok(())
}

fn prune_crash_logs(dir: &Path, keep: usize) -> Result<(), String> {
    let mut crash_files: Vec<(std::time::SystemTime, PathBuf)> = vec![];
    for entry in fs::read_dir(dir).map_err(|e| format!("Failed to read logs dir: {}", e))? {
        let entry = match entry {
            Ok(v) => v,
            Err(_) => continue,
        };
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !(name.starts_with("crash-") && name.ends_with(".log")) {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        crash_files.push((modified, path));
    }
    crash_files.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in crash_files.into_iter().skip(keep) {
        let _ = fs::remove_file(path);
    }
    Ok(())
}

pub fn append_line(level: &str, msg: &str) {
    let ts = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let line = format!("[{}] [{}] {}\n", ts, level, msg);
    if let Some(lock) = LOG_FILE.get() {
        if let Ok(mut f) = lock.lock() {
            let _ = f.write_all(line.as_bytes());
            let _ = f.flush();
        }
    }
}

pub fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let panic_msg = format!("{}", info);
        append_line("PANIC", &panic_msg);
        let bt = Backtrace::force_capture();
        append_line("PANIC", &format!("backtrace:\n{}", bt));
        let _ = write_crash_file(&panic_msg, &bt.to_string());
        previous(info);
    }));
}

fn write_crash_file(message: &str, backtrace: &str) -> Result<PathBuf, String> {
    let dir = logs_dir()?;
    fs::create_dir_all(&dir).map_err(|e| format!("Failed to create logs dir: {}", e))?;
    let name = format!("crash-{}.log", Local::now().format("%Y%m%d-%H%M%S"));
    let path = dir.join(name);
    let body = format!(
        "Lychee Talk crash report\nversion: {}\ntime: {}\n\nmessage:\n{}\n\nbacktrace:\n{}\n",
        env!("CARGO_PKG_VERSION"),
        Local::now().to_rfc3339(),
        message,
        backtrace
    );
    fs::write(&path, body).map_err(|e| format!("Failed to write crash log: {}", e))?;
    Ok(path)
}

#[macro_export]
macro_rules! app_log {
    ($($arg:tt)*) => {{
        ::std::println!($($arg)*);
        $crate::diagnostics::append_line("INFO", &format!($($arg)*));
    }};
}

#[macro_export]
macro_rules! app_err {
    ($($arg:tt)*) => {{
        ::std::eprintln!($($arg)*);
        $crate::diagnostics::append_line("ERROR", &format!($($arg)*));
    }};
}
