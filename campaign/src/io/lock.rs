//! Cross-process campaign lock backed by an atomically created directory.
//!
//! The lock is `campaign.lock/` with an `owner.json` inside. A lock is judged
//! stale when it is older than the staleness threshold and its owner is gone
//! (no owner file, or the recorded pid is not alive on this host). Where process
//! liveness cannot be checked, staleness is decided by age alone.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::CampaignError;
use crate::io::paths::LOCK_OWNER_FILE;

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Whether owner liveness is checked on this target.
pub const LIVENESS_CHECK_SUPPORTED: bool = cfg!(unix);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Give up with a lock timeout after waiting this long.
    pub wait_timeout: Duration,
    /// Minimum lock age before an abandoned lock may be broken.
    pub stale_after: Duration,
    /// Back-off between acquisition attempts.
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            stale_after: DEFAULT_STALE_AFTER,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Contents of `owner.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOwner {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            hostname: hostname(),
        }
    }

    /// Whether the owning process still runs. Owners on other hosts cannot be checked.
    ///
    /// An unknown hostname on either side counts as this host.
    pub fn is_alive(&self) -> bool {
        let local = hostname();
        if !self.hostname.is_empty() && !local.is_empty() && self.hostname != local {
            return false;
        }
        is_process_running(self.pid)
    }
}

/// What a contender saw when it judged a lock stale. Breaking only proceeds if
/// the directory it moved aside is still that lock.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LockIdentity {
    owner: Option<LockOwner>,
    #[cfg(unix)]
    inode: (u64, u64),
    #[cfg(not(unix))]
    modified: SystemTime,
}

impl LockIdentity {
    fn read(path: &Path) -> Result<Option<Self>> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("stat lock {}", path.display()));
            }
        };
        Ok(Some(Self {
            owner: read_owner(path),
            #[cfg(unix)]
            inode: {
                use std::os::unix::fs::MetadataExt;
                (metadata.dev(), metadata.ino())
            },
            #[cfg(not(unix))]
            modified: metadata
                .modified()
                .with_context(|| format!("lock mtime {}", path.display()))?,
        }))
    }

    fn owner_is_alive(&self) -> bool {
        LIVENESS_CHECK_SUPPORTED && self.owner.as_ref().is_some_and(LockOwner::is_alive)
    }
}

/// Held lock; the directory is removed on drop if it still carries our owner.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    owner: LockOwner,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if read_owner(&self.path).as_ref() != Some(&self.owner) {
            warn!(path = %self.path.display(), "lock no longer ours; leaving it in place");
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "lock released"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), err = %err, "failed to release lock"),
        }
    }
}

/// Run `body` while holding the lock at `lock_path`.
///
/// The lock is released when `body` returns, whether it succeeded or not. A
/// contended lock that does not free up within `options.wait_timeout` yields
/// [`CampaignError::LockTimeout`].
pub fn with_lock<T, F>(lock_path: &Path, options: &LockOptions, body: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let _guard = acquire(lock_path, options)?;
    body()
}

/// Acquire the lock, breaking it first if it is stale.
#[instrument(skip_all, fields(lock = %lock_path.display()))]
pub fn acquire(lock_path: &Path, options: &LockOptions) -> Result<LockGuard> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create lock parent {}", parent.display()))?;
    }

    let started = Instant::now();
    loop {
        match fs::create_dir(lock_path) {
            Ok(()) => {
                let owner = LockOwner::current();
                if let Err(err) = write_owner(lock_path, &owner) {
                    let _ = fs::remove_dir_all(lock_path);
                    return Err(err);
                }
                debug!("lock acquired");
                return Ok(LockGuard {
                    path: lock_path.to_path_buf(),
                    owner,
                });
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(err).with_context(|| format!("create lock {}", lock_path.display()));
            }
        }

        if let Some(observed) = stale_lock(lock_path, options.stale_after)? {
            break_stale(lock_path, &observed)?;
            continue;
        }

        let waited = started.elapsed();
        if waited >= options.wait_timeout {
            warn!(waited_ms = waited.as_millis() as u64, "lock wait timed out");
            return Err(CampaignError::LockTimeout {
                path: lock_path.to_path_buf(),
                waited,
            }
            .into());
        }
        thread::sleep(options.poll_interval.min(options.wait_timeout - waited));
    }
}

/// Read `owner.json` if present and parseable.
pub fn read_owner(lock_path: &Path) -> Option<LockOwner> {
    let contents = fs::read_to_string(lock_path.join(LOCK_OWNER_FILE)).ok()?;
    serde_json::from_str(&contents).ok()
}

fn write_owner(lock_path: &Path, owner: &LockOwner) -> Result<()> {
    let owner_path = lock_path.join(LOCK_OWNER_FILE);
    let mut buf = serde_json::to_string_pretty(owner)?;
    buf.push('\n');
    fs::write(&owner_path, buf).with_context(|| format!("write {}", owner_path.display()))
}

/// The lock's identity if it exists, is older than `stale_after`, and has no
/// live owner.
fn stale_lock(lock_path: &Path, stale_after: Duration) -> Result<Option<LockIdentity>> {
    let Some(age) = lock_age(lock_path)? else {
        // Released between our create attempt and now; retry immediately.
        return Ok(None);
    };
    if age <= stale_after {
        return Ok(None);
    }
    let Some(identity) = LockIdentity::read(lock_path)? else {
        return Ok(None);
    };
    if identity.owner_is_alive() {
        return Ok(None);
    }
    Ok(Some(identity))
}

fn lock_age(lock_path: &Path) -> Result<Option<Duration>> {
    let metadata = match fs::metadata(lock_path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("stat lock {}", lock_path.display()));
        }
    };
    let modified = metadata
        .modified()
        .with_context(|| format!("lock mtime {}", lock_path.display()))?;
    Ok(Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    ))
}

/// Move the lock aside and delete it, provided the moved directory is still
/// the lock judged stale as `observed`.
///
/// Another contender may have broken that lock and taken a fresh one since the
/// staleness check. In that case the moved directory is put back and nothing is
/// deleted. Returns whether a lock was removed.
fn break_stale(lock_path: &Path, observed: &LockIdentity) -> Result<bool> {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let tombstone = lock_path.with_extension(format!("stale.{}.{nanos}", std::process::id()));
    match fs::rename(lock_path, &tombstone) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(err).with_context(|| format!("break stale lock {}", lock_path.display()));
        }
    }

    let moved = LockIdentity::read(&tombstone)?;
    let still_stale = moved
        .as_ref()
        .is_some_and(|moved| moved == observed && !moved.owner_is_alive());
    if !still_stale {
        debug!(lock = %lock_path.display(), "lock changed hands before it could be broken");
        restore(&tombstone, lock_path)?;
        return Ok(false);
    }

    info!(lock = %lock_path.display(), "broke stale lock");
    fs::remove_dir_all(&tombstone)
        .with_context(|| format!("remove stale lock {}", tombstone.display()))?;
    Ok(true)
}

fn restore(tombstone: &Path, lock_path: &Path) -> Result<()> {
    match fs::rename(tombstone, lock_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => {
            warn!(
                lock = %lock_path.display(),
                tombstone = %tombstone.display(),
                err = %err,
                "could not put a live lock back"
            );
            Err(err).with_context(|| format!("restore lock {}", lock_path.display()))
        }
    }
}

#[cfg(unix)]
fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_default()
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    false
}
