//! dipwatch: dip signal recorder and trigger evaluation engine for DEX pairs
//!
//! A detected dip becomes a signal plus a PENDING trigger evaluation; the
//! analyzer later resolves it from stored price bars to TP1_FIRST, SL_FIRST,
//! NEITHER or NO_DATA. A single-instance lock guards the long-running loop and
//! the prune manager keeps storage bounded without touching in-flight windows.

pub mod arguments;
pub mod commands;
pub mod config;
pub mod errors;
pub mod export;
pub mod logger;
pub mod paths;
pub mod process_lock;
pub mod prune;
pub mod scheduler;
pub mod signals;
pub mod storage;
pub mod triggers;
