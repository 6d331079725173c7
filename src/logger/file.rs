//! Daily log file output
//!
//! One plain-text file per day (`dipwatch_YYYY-MM-DD.log`) in the configured
//! logs directory. The file is reopened when the date rolls over.

use chrono::Local;
use once_cell::sync::Lazy;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;

struct FileSink {
    dir: PathBuf,
    date: String,
    writer: BufWriter<File>,
}

static FILE_SINK: Lazy<Mutex<Option<FileSink>>> = Lazy::new(|| Mutex::new(None));

fn log_file_name(date: &str) -> String {
    format!("dipwatch_{}.log", date)
}

fn open_sink(dir: PathBuf, date: String) -> std::io::Result<FileSink> {
    fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(log_file_name(&date)))?;
    Ok(FileSink {
        dir,
        date,
        writer: BufWriter::new(file),
    })
}

/// Open today's log file in `dir`. Failure disables file logging.
pub fn init_file_logging(dir: Option<PathBuf>) {
    let sink = dir.and_then(|dir| {
        let date = Local::now().format("%Y-%m-%d").to_string();
        match open_sink(dir, date) {
            Ok(sink) => Some(sink),
            Err(e) => {
                eprintln!("Failed to open log file, file logging disabled: {}", e);
                None
            }
        }
    });

    if let Ok(mut guard) = FILE_SINK.lock() {
        if let Some(old) = guard.as_mut() {
            let _ = old.writer.flush();
        }
        *guard = sink;
    }
}

pub fn write_to_file(line: &str) {
    let Ok(mut guard) = FILE_SINK.lock() else {
        return;
    };
    let Some(sink) = guard.as_mut() else {
        return;
    };

    let today = Local::now().format("%Y-%m-%d").to_string();
    if today != sink.date {
        let _ = sink.writer.flush();
        match open_sink(sink.dir.clone(), today) {
            Ok(next) => *sink = next,
            Err(_) => {
                *guard = None;
                return;
            }
        }
    }

    let _ = writeln!(sink.writer, "{}", line);
}

pub fn flush_file_logging() {
    if let Ok(mut guard) = FILE_SINK.lock() {
        if let Some(sink) = guard.as_mut() {
            let _ = sink.writer.flush();
        }
    }
}
