//! Configuration system for dipwatch
//!
//! TOML file + serde, every section declared with `config_struct!` so missing
//! keys fall back to their defaults:
//!
//! ```toml
//! [trigger]
//! tp1_pct = 40.0
//! sl_pct = 50.0
//! tie_break = "sl_first"
//!
//! [scheduler]
//! interval_secs = 60
//! ```
//!
//! `main` reads the file once and hands the `Config` down; core operations
//! take their settings as explicit arguments.

pub mod macros;
pub mod schemas;
pub mod utils;

pub use schemas::*;
pub use utils::{read_config_file, unknown_keys, validate_config};
