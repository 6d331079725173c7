//! Console and file rendering of log records
//!
//! Console lines go to stderr so command output on stdout (reports, JSON
//! exports) stays machine-readable. File lines are plain text.

use super::file::write_to_file;
use super::levels::LogLevel;
use super::tags::LogTag;
use chrono::Local;
use colored::*;
use std::io::{stderr, ErrorKind, Write};

/// Column widths for the `[tag] [level]` prefix
const TAG_WIDTH: usize = 9;
const LEVEL_WIDTH: usize = 7;

/// Console lines longer than this are wrapped under the message column
const CONSOLE_WIDTH: usize = 140;
/// Never wrap narrower than this, however long the prefix is
const MIN_MESSAGE_WIDTH: usize = 50;

/// Write one record to the console (stderr) and the log file
pub fn format_and_log(tag: &LogTag, level: LogLevel, message: &str) {
    let now = Local::now();
    let clock = now.format("%H:%M:%S").to_string();

    // "HH:MM:SS [tag      ] [LEVEL  ] "
    let prefix_width = clock.len() + TAG_WIDTH + LEVEL_WIDTH + 7;
    let prefix = format!(
        "{} [{}] [{}] ",
        clock.dimmed(),
        format_tag(tag),
        format_level(level)
    );
    let indent = " ".repeat(prefix_width);
    let width = CONSOLE_WIDTH
        .saturating_sub(prefix_width)
        .max(MIN_MESSAGE_WIDTH);

    let file_prefix = format!(
        "{} [{}] [{}]",
        now.format("%Y-%m-%d %H:%M:%S%.3f"),
        tag.to_plain_string(),
        level.as_str()
    );

    for (n, chunk) in wrap_text(message, width).iter().enumerate() {
        let lead = if n == 0 { prefix.as_str() } else { indent.as_str() };
        print_stderr_safe(&format!("{}{}", lead, chunk));
        write_to_file(&format!("{} {}", file_prefix, chunk));
    }
}

/// Format a tag with appropriate color
fn format_tag(tag: &LogTag) -> ColoredString {
    let label = format!("{:<width$}", tag.to_plain_string(), width = TAG_WIDTH);
    match tag {
        LogTag::System => label.bright_yellow().bold(),
        LogTag::Storage => label.bright_blue().bold(),
        LogTag::Recorder => label.bright_magenta().bold(),
        LogTag::Detector => label.bright_cyan().bold(),
        LogTag::Analyzer => label.bright_green().bold(),
        LogTag::Lock => label.bright_red().bold(),
        LogTag::Prune => label.bright_white().bold(),
        LogTag::Scheduler => label.bright_purple().bold(),
        LogTag::Export => label.bright_blue().bold(),
        LogTag::Other(_) => label.white().bold(),
    }
}

fn format_level(level: LogLevel) -> ColoredString {
    let label = format!("{:<width$}", level.as_str(), width = LEVEL_WIDTH);
    match level {
        LogLevel::Error => label.bright_red().bold(),
        LogLevel::Warning => label.bright_yellow().bold(),
        LogLevel::Info => label.white().bold(),
        LogLevel::Debug | LogLevel::Verbose => label.dimmed(),
    }
}

/// Print to stderr but ignore broken pipe errors
fn print_stderr_safe(message: &str) {
    let mut handle = stderr().lock();
    if let Err(e) = writeln!(handle, "{}", message) {
        if e.kind() == ErrorKind::BrokenPipe {
            return;
        }
    }
    let _ = handle.flush();
}

/// Split `text` into lines of at most `width` characters.
///
/// Embedded newlines are kept. Words are never split unless a single word is
/// wider than `width` (addresses, paths), in which case it is cut into
/// fixed-width pieces.
fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();

    for paragraph in text.split('\n') {
        if paragraph.chars().count() <= width {
            lines.push(paragraph.to_string());
            continue;
        }

        let mut line = String::new();
        let mut line_len = 0;
        for word in paragraph.split_whitespace() {
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(width) {
                let need = if line_len == 0 { piece.len() } else { line_len + 1 + piece.len() };
                if need > width {
                    lines.push(std::mem::take(&mut line));
                    line_len = 0;
                }
                if line_len > 0 {
                    line.push(' ');
                    line_len += 1;
                }
                line.extend(piece.iter());
                line_len += piece.len();
            }
        }
        if line_len > 0 {
            lines.push(line);
        }
    }

    lines
}
