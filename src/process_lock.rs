//! Single-instance lock per storage target
//!
//! The lock is an advisory file `<db>.lock` next to the database holding the
//! owner pid, acquisition time and last heartbeat (JSON). A holder counts as
//! alive while its pid is running and its heartbeat is fresher than the stale
//! threshold; otherwise the next caller reclaims the lock.
//!
//! Every read-modify-write of the lock file (acquire, reclaim, heartbeat,
//! release) runs under an exclusive OS lock on `<db>.lock.guard`, so two
//! contenders can never both judge the same record stale and each replace it.
//! The guard file is left in place; the OS drops the lock when the handle
//! closes, including on crash.
//!
//! `ProcessLock` is the RAII guard used by `run`: dropping it releases the
//! lock, so every exit path (error, signal, panic unwind) cleans up.

use crate::errors::{DipwatchError, DipwatchResult};
use crate::logger::{self, LogTag};
use crate::paths::lock_path_for;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Pid, System};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner_pid: u32,
    pub acquired_at_ms: i64,
    pub heartbeat_at_ms: i64,
}

enum Holder {
    Free,
    /// Record left by a dead or silent holder; may be removed
    Stale,
    Owned(LockRecord),
    Alive(LockRecord),
    /// File exists but is unreadable and recent (another process mid-write)
    Unknown,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// True when a process with this pid is currently running
pub fn is_pid_running(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_process(pid);
    sys.process(pid).is_some()
}

/// Read the lock record for a storage target, if any
pub fn read_lock(storage_target: &Path) -> DipwatchResult<Option<LockRecord>> {
    let path = lock_path_for(storage_target);
    match fs::read_to_string(&path) {
        Ok(contents) => Ok(serde_json::from_str(&contents).ok()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn guard_path(lock_path: &Path) -> PathBuf {
    let mut name = OsString::from(lock_path.as_os_str());
    name.push(".guard");
    PathBuf::from(name)
}

/// Block until this handle holds the exclusive guard for `lock_path`.
/// The guard is released when the returned file is dropped.
pub(crate) fn lock_guard(lock_path: &Path) -> DipwatchResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(guard_path(lock_path))?;
    file.lock()?;
    Ok(file)
}

fn write_record_atomic(path: &Path, record: &LockRecord) -> DipwatchResult<()> {
    let tmp = path.with_extension(format!("lock.{}.tmp", record.owner_pid));
    fs::write(&tmp, serde_json::to_vec(record)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn classify(path: &Path, owner_pid: u32, stale_after: Duration) -> DipwatchResult<Holder> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Holder::Free),
        Err(e) => return Err(e.into()),
    };

    let Ok(record) = serde_json::from_str::<LockRecord>(&contents) else {
        let age = fs::metadata(path)?
            .modified()?
            .elapsed()
            .unwrap_or_default();
        return Ok(if age > stale_after {
            Holder::Stale
        } else {
            Holder::Unknown
        });
    };

    if record.owner_pid == owner_pid {
        return Ok(Holder::Owned(record));
    }

    let heartbeat_age_ms = now_ms().saturating_sub(record.heartbeat_at_ms);
    let fresh = heartbeat_age_ms <= stale_after.as_millis() as i64;
    if fresh && is_pid_running(record.owner_pid) {
        Ok(Holder::Alive(record))
    } else {
        logger::warning(
            LogTag::Lock,
            &format!(
                "Reclaiming stale lock {} (pid {}, heartbeat {}s ago)",
                path.display(),
                record.owner_pid,
                heartbeat_age_ms / 1000
            ),
        );
        Ok(Holder::Stale)
    }
}

/// Try to take the lock for `storage_target` on behalf of `owner_pid`.
///
/// Returns false while another live holder exists. Re-acquiring as the
/// current owner refreshes the heartbeat.
pub fn try_acquire(
    storage_target: &Path,
    owner_pid: u32,
    stale_after: Duration,
) -> DipwatchResult<bool> {
    let path = lock_path_for(storage_target);
    let _guard = lock_guard(&path)?;

    match classify(&path, owner_pid, stale_after)? {
        Holder::Alive(_) | Holder::Unknown => return Ok(false),
        Holder::Owned(mut record) => {
            record.heartbeat_at_ms = now_ms();
            write_record_atomic(&path, &record)?;
            return Ok(true);
        }
        Holder::Stale => match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        },
        Holder::Free => {}
    }

    let now = now_ms();
    let record = LockRecord {
        owner_pid,
        acquired_at_ms: now,
        heartbeat_at_ms: now,
    };

    // create_new still refuses to clobber a file written by a process that
    // bypassed the guard
    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            file.write_all(&serde_json::to_vec(&record)?)?;
            file.sync_all()?;
            logger::debug(
                LogTag::Lock,
                &format!("Acquired {} for pid {}", path.display(), owner_pid),
            );
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove the lock if `owner_pid` holds it; `NotLockOwner` otherwise
pub fn release(storage_target: &Path, owner_pid: u32) -> DipwatchResult<()> {
    let path = lock_path_for(storage_target);
    let _guard = lock_guard(&path)?;
    match read_lock(storage_target)? {
        None => Ok(()),
        Some(record) if record.owner_pid == owner_pid => {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            logger::debug(
                LogTag::Lock,
                &format!("Released {} (pid {})", path.display(), owner_pid),
            );
            Ok(())
        }
        Some(record) => Err(DipwatchError::NotLockOwner {
            target: storage_target.display().to_string(),
            holder_pid: record.owner_pid,
            owner_pid,
        }),
    }
}

/// Refresh the heartbeat of a held lock
pub fn heartbeat(storage_target: &Path, owner_pid: u32) -> DipwatchResult<()> {
    let path = lock_path_for(storage_target);
    let _guard = lock_guard(&path)?;
    match read_lock(storage_target)? {
        Some(mut record) if record.owner_pid == owner_pid => {
            record.heartbeat_at_ms = now_ms();
            write_record_atomic(&path, &record)
        }
        Some(record) => Err(DipwatchError::NotLockOwner {
            target: storage_target.display().to_string(),
            holder_pid: record.owner_pid,
            owner_pid,
        }),
        None => Err(DipwatchError::NotLockOwner {
            target: storage_target.display().to_string(),
            holder_pid: 0,
            owner_pid,
        }),
    }
}

/// RAII guard for the storage-target lock held by this process
pub struct ProcessLock {
    storage_target: PathBuf,
    owner_pid: u32,
    released: bool,
}

impl ProcessLock {
    /// Acquire for the current process, or fail with `LockHeld`
    pub fn acquire(storage_target: &Path, stale_after: Duration) -> DipwatchResult<Self> {
        let owner_pid = std::process::id();
        if try_acquire(storage_target, owner_pid, stale_after)? {
            logger::info(
                LogTag::Lock,
                &format!("Lock acquired for {}", storage_target.display()),
            );
            return Ok(Self {
                storage_target: storage_target.to_path_buf(),
                owner_pid,
                released: false,
            });
        }

        let holder_pid = read_lock(storage_target)?
            .map(|r| r.owner_pid)
            .unwrap_or_default();
        Err(DipwatchError::LockHeld {
            target: storage_target.display().to_string(),
            holder_pid,
        })
    }

    pub fn heartbeat(&self) -> DipwatchResult<()> {
        heartbeat(&self.storage_target, self.owner_pid)
    }

    pub fn storage_target(&self) -> &Path {
        &self.storage_target
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn release(mut self) -> DipwatchResult<()> {
        self.released = true;
        release(&self.storage_target, self.owner_pid)
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = release(&self.storage_target, self.owner_pid) {
            logger::warning(LogTag::Lock, &format!("Failed to release lock: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALE: Duration = Duration::from_secs(600);

    fn target() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("dipwatch.db");
        (dir, db)
    }

    fn write_record(db: &Path, record: &LockRecord) {
        fs::write(lock_path_for(db), serde_json::to_vec(record).unwrap()).unwrap();
    }

    #[test]
    fn test_second_acquire_blocked_while_live() {
        let (_dir, db) = target();
        let me = std::process::id();
        // Our own pid is live; a different owner id must be refused
        assert!(try_acquire(&db, me, STALE).unwrap());
        assert!(!try_acquire(&db, me.wrapping_add(1), STALE).unwrap());

        release(&db, me).unwrap();
        assert!(try_acquire(&db, me.wrapping_add(1), STALE).unwrap());
    }

    #[test]
    fn test_reacquire_refreshes_heartbeat() {
        let (_dir, db) = target();
        let me = std::process::id();
        write_record(
            &db,
            &LockRecord {
                owner_pid: me,
                acquired_at_ms: 1,
                heartbeat_at_ms: 1,
            },
        );
        assert!(try_acquire(&db, me, STALE).unwrap());
        let record = read_lock(&db).unwrap().unwrap();
        assert_eq!(record.acquired_at_ms, 1);
        assert!(record.heartbeat_at_ms > 1);
    }

    #[test]
    fn test_stale_heartbeat_reclaimed() {
        let (_dir, db) = target();
        let me = std::process::id();
        // Live pid but heartbeat far in the past
        write_record(
            &db,
            &LockRecord {
                owner_pid: me,
                acquired_at_ms: 0,
                heartbeat_at_ms: 0,
            },
        );
        let other = me.wrapping_add(1);
        assert!(try_acquire(&db, other, STALE).unwrap());
        assert_eq!(read_lock(&db).unwrap().unwrap().owner_pid, other);
    }

    #[test]
    fn test_dead_holder_reclaimed() {
        let (_dir, db) = target();
        let dead_pid = u32::MAX - 1;
        write_record(
            &db,
            &LockRecord {
                owner_pid: dead_pid,
                acquired_at_ms: now_ms(),
                heartbeat_at_ms: now_ms(),
            },
        );
        assert!(try_acquire(&db, std::process::id(), STALE).unwrap());
    }

    #[test]
    fn test_release_by_non_owner_fails() {
        let (_dir, db) = target();
        let me = std::process::id();
        assert!(try_acquire(&db, me, STALE).unwrap());
        let err = release(&db, me.wrapping_add(7)).unwrap_err();
        assert!(matches!(err, DipwatchError::NotLockOwner { .. }));
        assert!(lock_path_for(&db).exists());
        assert!(heartbeat(&db, me.wrapping_add(7)).is_err());
        heartbeat(&db, me).unwrap();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (_dir, db) = target();
        {
            let guard = ProcessLock::acquire(&db, STALE).unwrap();
            guard.heartbeat().unwrap();
            assert!(lock_path_for(&db).exists());
        }
        assert!(!lock_path_for(&db).exists());

        let guard = ProcessLock::acquire(&db, STALE).unwrap();
        guard.release().unwrap();
        assert!(!lock_path_for(&db).exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_concurrent_reclaim_has_one_winner() {
        use std::sync::{Arc, Barrier};

        for _ in 0..50 {
            let (_dir, db) = target();
            write_record(
                &db,
                &LockRecord {
                    owner_pid: 999_999,
                    acquired_at_ms: 0,
                    heartbeat_at_ms: 0,
                },
            );

            // Both owner ids are live processes (ours and init)
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = [std::process::id(), 1]
                .into_iter()
                .map(|owner| {
                    let barrier = Arc::clone(&barrier);
                    let db = db.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        try_acquire(&db, owner, STALE).unwrap()
                    })
                })
                .collect();
            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);

            let holder = read_lock(&db).unwrap().unwrap().owner_pid;
            assert!(holder == std::process::id() || holder == 1);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_guard_reports_lock_held() {
        let (_dir, db) = target();
        // pid 1 is always running on Linux
        write_record(
            &db,
            &LockRecord {
                owner_pid: 1,
                acquired_at_ms: now_ms(),
                heartbeat_at_ms: now_ms(),
            },
        );
        match ProcessLock::acquire(&db, STALE) {
            Err(DipwatchError::LockHeld { holder_pid, .. }) => assert_eq!(holder_pid, 1),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("lock should be held by pid 1"),
        }
        assert_eq!(read_lock(&db).unwrap().unwrap().owner_pid, 1);
    }
}
