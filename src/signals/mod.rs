//! Signal side of the engine: the dip detector and the recorder that turns a
//! detected entry into a signal plus its PENDING evaluation.

pub mod detector;
pub mod recorder;

pub use detector::{run_detection, screen_pair, DetectionStats, DetectorSettings};
pub use recorder::{enqueue_pending_evaluation, get_signal, record_signal};
