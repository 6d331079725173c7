/// Log tags identify the subsystem a message comes from.
///
/// The debug key (lowercase) is what `--debug <tag>` matches against.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogTag {
    System,
    Storage,
    Recorder,
    Detector,
    Analyzer,
    Lock,
    Prune,
    Scheduler,
    Export,
    Other(String),
}

impl LogTag {
    /// Key used for per-tag debug filtering
    pub fn to_debug_key(&self) -> String {
        match self {
            LogTag::System => "system".to_string(),
            LogTag::Storage => "storage".to_string(),
            LogTag::Recorder => "recorder".to_string(),
            LogTag::Detector => "detector".to_string(),
            LogTag::Analyzer => "analyzer".to_string(),
            LogTag::Lock => "lock".to_string(),
            LogTag::Prune => "prune".to_string(),
            LogTag::Scheduler => "scheduler".to_string(),
            LogTag::Export => "export".to_string(),
            LogTag::Other(s) => s.to_lowercase(),
        }
    }

    /// Uppercase label used in console and file output
    pub fn to_plain_string(&self) -> String {
        match self {
            LogTag::System => "SYSTEM".to_string(),
            LogTag::Storage => "STORAGE".to_string(),
            LogTag::Recorder => "RECORDER".to_string(),
            LogTag::Detector => "DETECTOR".to_string(),
            LogTag::Analyzer => "ANALYZER".to_string(),
            LogTag::Lock => "LOCK".to_string(),
            LogTag::Prune => "PRUNE".to_string(),
            LogTag::Scheduler => "SCHED".to_string(),
            LogTag::Export => "EXPORT".to_string(),
            LogTag::Other(s) => s.to_uppercase(),
        }
    }
}
