/// Error taxonomy for dipwatch
///
/// Every fallible library operation returns `DipwatchResult<T>`. The variants map
/// onto the process exit-code contract via `DipwatchError::exit_code()`:
/// - 0: success
/// - 1: fatal configuration or storage error
/// - 2: lock already held by a live process
use thiserror::Error;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_LOCK_HELD: i32 = 2;

#[derive(Error, Debug)]
pub enum DipwatchError {
    #[error("Configuration error: {0}")] Config(String),

    #[error("Lock held: {target} is locked by live process {holder_pid}")] LockHeld {
        target: String,
        holder_pid: u32,
    },

    #[error("Not lock owner: {target} is held by {holder_pid}, release requested by {owner_pid}")] NotLockOwner {
        target: String,
        holder_pid: u32,
        owner_pid: u32,
    },

    #[error("Schema integrity error: {0}")] SchemaIntegrity(String),

    #[error("Duplicate active signal: pair {pair_address} already has pending signal {signal_id}")] DuplicateActiveSignal {
        pair_address: String,
        signal_id: i64,
    },

    #[error("Duplicate evaluation: signal {signal_id} already has a trigger evaluation")] DuplicateEvaluation {
        signal_id: i64,
    },

    #[error("Unknown signal: {signal_id}")] UnknownSignal {
        signal_id: i64,
    },

    #[error("Invalid signal: {0}")] InvalidSignal(String),

    #[error("Invalid price bar: {0}")] InvalidPriceBar(String),

    #[error("Database error: {0}")] Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")] Serialization(#[from] serde_json::Error),

    #[error("Export error: {0}")] Export(#[from] csv::Error),

    #[error("IO error: {0}")] Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")] Task(String),
}

impl DipwatchError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            DipwatchError::LockHeld { .. } => EXIT_LOCK_HELD,
            _ => EXIT_FATAL,
        }
    }

    /// Invariant violations at the recorder/queue boundary
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            DipwatchError::DuplicateActiveSignal { .. }
                | DipwatchError::DuplicateEvaluation { .. }
                | DipwatchError::UnknownSignal { .. }
        )
    }

    /// Errors that must abort the whole operation, not just one evaluation
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            DipwatchError::Config(_) | DipwatchError::SchemaIntegrity(_) | DipwatchError::Io(_)
        )
    }
}

pub type DipwatchResult<T> = Result<T, DipwatchError>;
