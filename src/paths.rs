//! Centralized path resolution for dipwatch
//!
//! Default locations follow platform standards:
//! - **macOS**: `~/Library/Application Support/dipwatch/`
//! - **Windows**: `%LOCALAPPDATA%\dipwatch\`
//! - **Linux**: `$XDG_DATA_HOME/dipwatch/` (fallback `~/.local/share/dipwatch/`)
//!
//! ```text
//! dipwatch/
//! ├── data/
//! │ ├── config.toml
//! │ └── dipwatch.db (+ dipwatch.db.lock while `run` is active)
//! ├── logs/
//! │ └── dipwatch_*.log
//! └── exports/
//! ```
//!
//! Every default can be overridden: `--db`, `--config`, `logging.logs_dir`.

use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};

static BASE_DIRECTORY: Lazy<PathBuf> = Lazy::new(resolve_base_directory);

fn resolve_base_directory() -> PathBuf {
  const APP_DIR: &str = "dipwatch";

  dirs::data_local_dir()
    .or_else(dirs::data_dir)
    .or_else(dirs::home_dir)
    .map(|root| root.join(APP_DIR))
    .unwrap_or_else(|| PathBuf::from(APP_DIR))
}

pub fn get_base_directory() -> PathBuf {
  BASE_DIRECTORY.clone()
}

/// Databases and the config file
pub fn get_data_directory() -> PathBuf {
  BASE_DIRECTORY.join("data")
}

/// Daily log files
pub fn get_logs_directory() -> PathBuf {
  BASE_DIRECTORY.join("logs")
}

pub fn get_exports_directory() -> PathBuf {
  BASE_DIRECTORY.join("exports")
}

pub fn get_config_path() -> PathBuf {
  get_data_directory().join("config.toml")
}

pub fn get_default_db_path() -> PathBuf {
  get_data_directory().join("dipwatch.db")
}

/// Lock file guarding a storage target: `<db>.lock` next to the database
pub fn lock_path_for(db_path: &Path) -> PathBuf {
  let mut name = db_path
    .file_name()
    .map(|n| n.to_os_string())
    .unwrap_or_default();
  name.push(".lock");
  db_path.with_file_name(name)
}

/// Create the parent directory of `path` if it has one
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() {
      std::fs::create_dir_all(parent)?;
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_directory_layout() {
    let base = get_base_directory();
    assert!(get_data_directory().starts_with(&base));
    assert!(get_logs_directory().starts_with(&base));
    assert!(get_default_db_path().ends_with("data/dipwatch.db"));
  }

  #[test]
  fn test_lock_path_next_to_db() {
    let lock = lock_path_for(Path::new("/tmp/x/signals.db"));
    assert_eq!(lock, PathBuf::from("/tmp/x/signals.db.lock"));
  }

  #[test]
  fn test_ensure_parent_dir() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("a/b/c.db");
    ensure_parent_dir(&nested).unwrap();
    assert!(dir.path().join("a/b").is_dir());
  }
}
