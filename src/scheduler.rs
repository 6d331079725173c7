//! Long-running evaluation loop (`dipwatch run`)
//!
//! One cycle = detect -> analyze -> auto-prune, followed by an app_status
//! update. Cycles never overlap: the next one is queued by a timer only after
//! the previous one finished. The storage-target lock is held for the whole
//! loop. Its heartbeat is refreshed at the start of every cycle and by a
//! ticker task every third of the stale threshold, so long stages and sleeps
//! never let it age out.
//!
//! Shutdown is cooperative. SIGINT/SIGTERM set the shutdown flag, which is
//! checked before every cycle and before every stage; the in-flight stage runs
//! to completion (each stage commits per evaluation, so nothing is left half
//! written) and the lock guard is released on the way out.

use crate::config::Config;
use crate::errors::{DipwatchError, DipwatchResult};
use crate::logger::{self, LogTag};
use crate::process_lock::{self, ProcessLock};
use crate::prune::{self, PruneReport, RetentionPolicy};
use crate::signals::{run_detection, DetectionStats, DetectorSettings};
use crate::storage::app_status::CycleCounters;
use crate::storage::Database;
use crate::triggers::{run_analysis, AnalysisRunStats, AnalyzerSettings};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// SHUTDOWN
// =============================================================================

/// Shared shutdown flag with a wakeup for the inter-cycle sleep
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a request that lands before the
        // loop starts sleeping is not lost
        self.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless shutdown is requested first.
    /// Returns true when woken by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_requested(),
            _ = self.notify.notified() => true,
        }
    }
}

/// Wait for SIGINT/SIGTERM (Ctrl+C elsewhere) and return the signal name
pub async fn wait_for_shutdown_signal() -> DipwatchResult<&'static str> {
    #[cfg(unix)]
    let signal_name = {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sighup.recv() => "SIGHUP",
        }
    };

    #[cfg(not(unix))]
    let signal_name = {
        tokio::signal::ctrl_c().await?;
        "CTRL_C"
    };

    Ok(signal_name)
}

/// Background task translating OS signals into a shutdown request
pub fn spawn_signal_listener(shutdown: Arc<ShutdownSignal>) {
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(name) => {
                logger::warning(
                    LogTag::Scheduler,
                    &format!(
                        "Shutdown signal received ({}), finishing current stage",
                        name
                    ),
                );
                shutdown.request();
            }
            Err(e) => {
                logger::error(
                    LogTag::Scheduler,
                    &format!("Failed to listen for shutdown signals: {}", e),
                );
            }
        }
    });
}

// =============================================================================
// SETTINGS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub lock_stale_after: Duration,
    pub detector_enabled: bool,
    pub detector: DetectorSettings,
    pub analyzer: AnalyzerSettings,
    pub auto_prune: bool,
    pub retention: RetentionPolicy,
    pub vacuum: bool,
    /// Stop after this many cycles (None = until shutdown)
    pub max_cycles: Option<u64>,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.scheduler.interval_secs),
            lock_stale_after: Duration::from_secs(config.scheduler.lock_stale_after_secs),
            detector_enabled: config.detector.enabled,
            detector: DetectorSettings::from_config(&config.detector, &config.trigger),
            analyzer: AnalyzerSettings::from_config(&config.trigger),
            auto_prune: config.retention.auto_prune,
            retention: RetentionPolicy::from_config(&config.retention),
            vacuum: config.retention.vacuum,
            max_cycles: None,
        }
    }

    /// The lock must outlive the gap between cycles
    pub fn validate(&self) -> DipwatchResult<()> {
        if self.interval >= self.lock_stale_after {
            return Err(DipwatchError::Config(format!(
                "cycle interval {}s must be shorter than lock_stale_after_secs {}s",
                self.interval.as_secs(),
                self.lock_stale_after.as_secs()
            )));
        }
        Ok(())
    }

    fn heartbeat_period(&self) -> Duration {
        (self.lock_stale_after / 3).max(Duration::from_millis(10))
    }
}

// =============================================================================
// CYCLE
// =============================================================================

/// What one cycle did. A `None` stage was disabled or skipped by shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub detection: Option<DetectionStats>,
    pub analysis: Option<AnalysisRunStats>,
    pub prune: Option<PruneReport>,
    pub interrupted: bool,
}

impl CycleReport {
    fn add_to(&self, counters: &mut CycleCounters) {
        if let Some(detection) = &self.detection {
            counters.signals_recorded += detection.signals_recorded as u64;
        }
        if let Some(analysis) = &self.analysis {
            counters.evaluations_done += analysis.done as u64;
            counters.evaluations_no_data += analysis.no_data as u64;
            counters.evaluations_failed += analysis.failed as u64;
        }
        if let Some(prune) = &self.prune {
            counters.rows_pruned += prune.deleted.total() as u64;
        }
    }
}

/// Run blocking SQLite work off the async executor
async fn blocking<F, R>(f: F) -> DipwatchResult<R>
where
    F: FnOnce() -> DipwatchResult<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DipwatchError::Task(e.to_string()))?
}

/// Run the stages of one cycle in order, stopping early on shutdown
pub async fn run_cycle(
    db: &Database,
    settings: &SchedulerSettings,
    shutdown: &ShutdownSignal,
) -> DipwatchResult<CycleReport> {
    let mut report = CycleReport::default();

    if settings.detector_enabled {
        if shutdown.is_requested() {
            report.interrupted = true;
            return Ok(report);
        }
        let db = db.clone();
        let detector = settings.detector;
        report.detection = Some(blocking(move || run_detection(&db, now_ms(), &detector)).await?);
    }

    if shutdown.is_requested() {
        report.interrupted = true;
        return Ok(report);
    }
    {
        let db = db.clone();
        let analyzer = settings.analyzer;
        report.analysis = Some(blocking(move || run_analysis(&db, now_ms(), &analyzer)).await?);
    }

    if settings.auto_prune {
        if shutdown.is_requested() {
            report.interrupted = true;
            return Ok(report);
        }
        let db = db.clone();
        let retention = settings.retention;
        let vacuum = settings.vacuum;
        report.prune =
            Some(blocking(move || prune::prune(&db, &retention, now_ms(), false, vacuum)).await?);
    }

    Ok(report)
}

// =============================================================================
// LOOP
// =============================================================================

/// Refresh the lock heartbeat every `period` until aborted. Losing the lock
/// sets `lost` and requests shutdown.
fn spawn_heartbeat_ticker(
    storage_target: PathBuf,
    owner_pid: u32,
    period: Duration,
    shutdown: Arc<ShutdownSignal>,
    lost: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let target = storage_target.clone();
            match blocking(move || process_lock::heartbeat(&target, owner_pid)).await {
                Ok(()) => {}
                Err(e @ DipwatchError::NotLockOwner { .. }) => {
                    logger::error(LogTag::Lock, &format!("Lock lost: {}", e));
                    lost.store(true, Ordering::SeqCst);
                    shutdown.request();
                    return;
                }
                Err(e) => {
                    logger::warning(LogTag::Lock, &format!("Heartbeat failed: {}", e));
                }
            }
        }
    })
}

async fn record_failure(db: &Database, error: &DipwatchError) {
    let db = db.clone();
    let message = error.to_string();
    let result = blocking(move || db.record_app_error(now_ms(), &message)).await;
    if let Err(e) = result {
        logger::warning(
            LogTag::Scheduler,
            &format!("Failed to record error in app_status: {}", e),
        );
    }
}

/// Cycle, heartbeat and sleep until shutdown, `max_cycles` or a fatal error
async fn cycle_until_stopped(
    db: &Database,
    settings: &SchedulerSettings,
    shutdown: &ShutdownSignal,
    lock: &ProcessLock,
    counters: &mut CycleCounters,
) -> DipwatchResult<()> {
    loop {
        if shutdown.is_requested() {
            break;
        }

        match lock.heartbeat() {
            Ok(()) => {}
            Err(e @ DipwatchError::NotLockOwner { .. }) => {
                logger::error(LogTag::Lock, &format!("Lock lost: {}", e));
                return Err(e);
            }
            Err(e) => {
                logger::warning(LogTag::Lock, &format!("Heartbeat failed: {}", e));
            }
        }

        {
            let db = db.clone();
            blocking(move || db.mark_cycle_started(now_ms())).await?;
        }

        match run_cycle(db, settings, shutdown).await {
            Ok(report) => {
                counters.cycles += 1;
                report.add_to(counters);

                if let Some(analysis) = &report.analysis {
                    logger::debug(
                        LogTag::Scheduler,
                        &format!(
                            "Cycle {}: examined {}, done {}, no_data {}, pending {}, failed {}",
                            counters.cycles,
                            analysis.examined,
                            analysis.done,
                            analysis.no_data,
                            analysis.still_pending,
                            analysis.failed
                        ),
                    );
                }

                let db = db.clone();
                let snapshot = counters.clone();
                blocking(move || db.mark_cycle_finished(now_ms(), &snapshot)).await?;
            }
            Err(e) => {
                counters.failed_cycles += 1;
                logger::error(LogTag::Scheduler, &format!("Cycle failed: {}", e));
                record_failure(db, &e).await;
                if e.is_critical() {
                    return Err(e);
                }
            }
        }

        if let Some(max) = settings.max_cycles {
            if counters.cycles + counters.failed_cycles >= max {
                break;
            }
        }

        if shutdown.sleep(settings.interval).await {
            break;
        }
    }

    Ok(())
}

/// Hold the storage lock and run cycles until shutdown (or `max_cycles`).
///
/// Returns `LockHeld` immediately if another live process owns the target.
/// Per-cycle failures are recorded in app_status and the loop continues;
/// critical errors (config, schema, io) and losing the lock end it.
pub async fn run_loop(
    db: Database,
    settings: SchedulerSettings,
    shutdown: Arc<ShutdownSignal>,
) -> DipwatchResult<CycleCounters> {
    settings.validate()?;
    let lock = ProcessLock::acquire(db.path(), settings.lock_stale_after)?;
    let mut counters = CycleCounters::default();

    logger::info(
        LogTag::Scheduler,
        &format!(
            "Scheduler started on {} (interval {}s, auto-prune {})",
            db.path().display(),
            settings.interval.as_secs(),
            if settings.auto_prune { "on" } else { "off" }
        ),
    );

    let lost = Arc::new(AtomicBool::new(false));
    let ticker = spawn_heartbeat_ticker(
        lock.storage_target().to_path_buf(),
        lock.owner_pid(),
        settings.heartbeat_period(),
        Arc::clone(&shutdown),
        Arc::clone(&lost),
    );
    let result = cycle_until_stopped(&db, &settings, &shutdown, &lock, &mut counters).await;
    ticker.abort();
    result?;

    if lost.load(Ordering::SeqCst) {
        // Surfaces the NotLockOwner error; the guard's drop only warns
        lock.heartbeat()?;
    }

    lock.release()?;
    logger::info(
        LogTag::Scheduler,
        &format!(
            "Scheduler stopped after {} cycles ({} failed)",
            counters.cycles, counters.failed_cycles
        ),
    );
    Ok(counters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_lock::read_lock;
    use crate::signals::record_signal;
    use crate::storage::types::{NewSignal, PriceBar, SignalParams, Timeframe};

    fn settings() -> SchedulerSettings {
        let mut s = SchedulerSettings::from_config(&Config::default());
        s.interval = Duration::from_millis(10);
        s.detector_enabled = false;
        s
    }

    fn temp_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::create(dir.path().join("dipwatch.db")).unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_cycle_resolves_pending() {
        let (_dir, db) = temp_db();
        let now = now_ms();
        let entry_ts = now - 2 * 3_600_000;
        let id = record_signal(
            &db,
            &NewSignal {
                pair_address: "PAIR".to_string(),
                entry_ts,
                entry_price: 1.0,
                params: SignalParams {
                    tp1_pct: 10.0,
                    sl_pct: 5.0,
                    lookahead_ms: 3_600_000,
                    timeframe: Timeframe::Minute5,
                },
                ath_price: None,
                drop_from_ath: None,
            },
            entry_ts,
        )
        .unwrap();
        db.insert_price_bar(&PriceBar {
            pair_address: "PAIR".to_string(),
            timeframe: Timeframe::Minute5,
            ts: entry_ts + 300_000,
            open: 1.0,
            high: 1.2,
            low: 0.99,
            close: 1.1,
            volume: 10.0,
        })
        .unwrap();

        let shutdown = ShutdownSignal::new();
        let report = run_cycle(&db, &settings(), &shutdown).await.unwrap();
        assert!(!report.interrupted);
        assert!(report.detection.is_none());
        let analysis = report.analysis.unwrap();
        assert_eq!(analysis.done, 1);
        assert!(report.prune.is_some());

        let evaluation = crate::triggers::get_evaluation(&db, id).unwrap().unwrap();
        assert_eq!(
            evaluation.outcome,
            Some(crate::storage::types::Outcome::Tp1First)
        );
    }

    #[tokio::test]
    async fn test_cycle_stops_on_shutdown() {
        let (_dir, db) = temp_db();
        let shutdown = ShutdownSignal::new();
        shutdown.request();
        let report = run_cycle(&db, &settings(), &shutdown).await.unwrap();
        assert!(report.interrupted);
        assert!(report.analysis.is_none());
    }

    #[tokio::test]
    async fn test_loop_runs_cycles_and_releases_lock() {
        let (_dir, db) = temp_db();
        let mut s = settings();
        s.max_cycles = Some(2);

        let counters = run_loop(db.clone(), s, ShutdownSignal::new()).await.unwrap();
        assert_eq!(counters.cycles, 2);
        assert_eq!(counters.failed_cycles, 0);
        assert!(read_lock(db.path()).unwrap().is_none());

        let status = db.get_app_status().unwrap().unwrap();
        assert_eq!(status.counters.cycles, 2);
        assert!(status.last_cycle_finished_at_ms.is_some());
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_loop_exits_when_shutdown_requested() {
        let (_dir, db) = temp_db();
        let shutdown = ShutdownSignal::new();
        shutdown.request();
        let counters = run_loop(db.clone(), settings(), shutdown).await.unwrap();
        assert_eq!(counters.cycles, 0);
        assert!(read_lock(db.path()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_loop_rejects_interval_longer_than_stale_threshold() {
        let (_dir, db) = temp_db();
        let mut s = settings();
        s.interval = Duration::from_secs(900);
        s.lock_stale_after = Duration::from_secs(600);

        let err = run_loop(db.clone(), s, ShutdownSignal::new()).await.unwrap_err();
        assert!(matches!(err, DipwatchError::Config(_)));
        assert!(read_lock(db.path()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ticker_refreshes_heartbeat_and_detects_loss() {
        let (_dir, db) = temp_db();
        let me = std::process::id();
        assert!(process_lock::try_acquire(db.path(), me, Duration::from_secs(600)).unwrap());

        let shutdown = ShutdownSignal::new();
        let lost = Arc::new(AtomicBool::new(false));
        let ticker = spawn_heartbeat_ticker(
            db.path().to_path_buf(),
            me,
            Duration::from_millis(20),
            shutdown.clone(),
            lost.clone(),
        );

        let lock_file = crate::paths::lock_path_for(db.path());
        let aged = process_lock::LockRecord {
            owner_pid: me,
            acquired_at_ms: 1,
            heartbeat_at_ms: 1,
        };
        {
            let _guard = process_lock::lock_guard(&lock_file).unwrap();
            std::fs::write(&lock_file, serde_json::to_vec(&aged).unwrap()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(read_lock(db.path()).unwrap().unwrap().heartbeat_at_ms > 1);
        assert!(!lost.load(Ordering::SeqCst));

        // Another process took over the target
        let other = process_lock::LockRecord {
            owner_pid: me.wrapping_add(1),
            acquired_at_ms: now_ms(),
            heartbeat_at_ms: now_ms(),
        };
        {
            let _guard = process_lock::lock_guard(&lock_file).unwrap();
            std::fs::write(&lock_file, serde_json::to_vec(&other).unwrap()).unwrap();
        }
        assert!(shutdown.sleep(Duration::from_secs(5)).await);
        assert!(lost.load(Ordering::SeqCst));

        ticker.await.unwrap();
        assert_eq!(read_lock(db.path()).unwrap().unwrap().owner_pid, me.wrapping_add(1));
    }

    #[tokio::test]
    async fn test_sleep_wakes_on_request() {
        let shutdown = ShutdownSignal::new();
        let waker = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waker.request();
        });
        assert!(shutdown.sleep(Duration::from_secs(3600)).await);
    }
}
