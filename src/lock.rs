//! Cross-process index locking.
//!
//! Index files are protected by an advisory OS lock (`fs2`, flock-class) on a
//! lock file next to them. OS locks belong to the whole process, so several
//! logical clients inside one process cannot be told apart by the kernel. The
//! [`LockRegistry`] closes that gap: it takes the OS lock once per file
//! identity and arbitrates every [`OwnerToken`] of the process in memory.
//!
//! * Shared holders with different tokens coexist as a reader set.
//! * An exclusive request over another token's reader set reports `false`
//!   at once; waiting cannot help, since readers in this process only leave
//!   when their owner closes them.
//! * Requests blocked by another token's exclusive hold, or by another
//!   process, wait up to the timeout and then report `false`.
//! * A token may upgrade its shared hold only while it is the sole reader.
//! * A token taking a lock it already holds is a programming error.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use same_file::Handle;
use uuid::Uuid;

use crate::error::{MailFtsError, Result};

/// How often a waiter re-checks a lock held by another process.
const OS_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Identity of one logical client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerToken(Uuid);

impl OwnerToken {
    pub fn new() -> Self {
        OwnerToken(Uuid::new_v4())
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct LockEntry {
    file: File,
    mode: LockMode,
    holders: BTreeSet<OwnerToken>,
}

/// Process-level table of held index locks, keyed by file identity.
#[derive(Debug, Default)]
pub struct LockRegistry {
    entries: Mutex<AHashMap<Handle, LockEntry>>,
    released: Condvar,
}

fn open_lock_file(path: &Path) -> Result<(File, Handle)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let identity = Handle::from_file(file.try_clone()?)?;
    Ok((file, identity))
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Try the OS lock once; `Ok(false)` when another process holds it.
fn try_os_lock(file: &File, mode: LockMode) -> Result<bool> {
    let attempt = match mode {
        LockMode::Shared => FileExt::try_lock_shared(file),
        LockMode::Exclusive => FileExt::try_lock_exclusive(file),
    };
    match attempt {
        Ok(()) => Ok(true),
        Err(e) if is_contended(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `path` for `token`. Returns `false` when the lock could not be
    /// obtained within `timeout` (zero means a single attempt).
    pub fn acquire(
        &self,
        path: &Path,
        mode: LockMode,
        timeout: Duration,
        token: OwnerToken,
    ) -> Result<bool> {
        let (file, identity) = open_lock_file(path)?;
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock();
        let mut logged_wait = false;

        loop {
            if let Some(entry) = entries.get_mut(&identity) {
                if entry.holders.contains(&token) {
                    debug_assert!(false, "lock token {token} re-entered {}", path.display());
                    return Err(MailFtsError::LockContention(format!(
                        "token {token} already holds {}",
                        path.display()
                    )));
                }
                match (mode, entry.mode) {
                    (LockMode::Shared, LockMode::Shared) => {
                        entry.holders.insert(token);
                        return Ok(true);
                    }
                    (LockMode::Exclusive, LockMode::Shared) => {
                        log::debug!(
                            "exclusive lock on {} refused: {} readers",
                            path.display(),
                            entry.holders.len()
                        );
                        return Ok(false);
                    }
                    _ => {}
                }
            } else if try_os_lock(&file, mode)? {
                entries.insert(
                    identity,
                    LockEntry {
                        file,
                        mode,
                        holders: BTreeSet::from([token]),
                    },
                );
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                log::debug!("lock on {} not available ({mode:?})", path.display());
                return Ok(false);
            }
            if !logged_wait {
                log::debug!("waiting for {mode:?} lock on {}", path.display());
                logged_wait = true;
            }
            let wait = (deadline - now).min(OS_RETRY_INTERVAL);
            self.released.wait_for(&mut entries, wait);
        }
    }

    /// Upgrade a shared hold to exclusive. Succeeds only while `token` is
    /// the sole reader in this process and no other process reads.
    pub fn try_upgrade(&self, path: &Path, token: OwnerToken) -> Result<bool> {
        let (_, identity) = open_lock_file(path)?;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&identity)
            .filter(|entry| entry.holders.contains(&token))
            .ok_or_else(|| not_held(path, token))?;

        match entry.mode {
            LockMode::Exclusive => Ok(true),
            LockMode::Shared if entry.holders.len() == 1 => {
                if try_os_lock(&entry.file, LockMode::Exclusive)? {
                    entry.mode = LockMode::Exclusive;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            LockMode::Shared => Ok(false),
        }
    }

    /// Turn an exclusive hold back into a shared one.
    pub fn downgrade(&self, path: &Path, token: OwnerToken) -> Result<()> {
        let (_, identity) = open_lock_file(path)?;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&identity)
            .filter(|entry| entry.holders.contains(&token))
            .ok_or_else(|| not_held(path, token))?;

        if entry.mode == LockMode::Exclusive {
            FileExt::lock_shared(&entry.file)?;
            entry.mode = LockMode::Shared;
            self.released.notify_all();
        }
        Ok(())
    }

    /// Drop `token`'s hold; the OS lock goes away with the last holder.
    pub fn release(&self, path: &Path, token: OwnerToken) -> Result<()> {
        let (_, identity) = open_lock_file(path)?;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&identity)
            .filter(|entry| entry.holders.contains(&token))
            .ok_or_else(|| not_held(path, token))?;

        entry.holders.remove(&token);
        if entry.holders.is_empty()
            && let Some(entry) = entries.remove(&identity)
        {
            FileExt::unlock(&entry.file)?;
        }
        self.released.notify_all();
        Ok(())
    }

    /// Current mode and number of in-process holders of `path`.
    pub fn state(&self, path: &Path) -> Result<Option<(LockMode, usize)>> {
        let (_, identity) = open_lock_file(path)?;
        let entries = self.entries.lock();
        Ok(entries
            .get(&identity)
            .map(|entry| (entry.mode, entry.holders.len())))
    }

    /// Acquire and wrap the hold in a guard; a timeout becomes
    /// [`MailFtsError::LockTimeout`].
    pub fn lock(
        self: &Arc<Self>,
        path: &Path,
        mode: LockMode,
        timeout: Duration,
        token: OwnerToken,
    ) -> Result<IndexLock> {
        if !self.acquire(path, mode, timeout, token)? {
            return Err(MailFtsError::LockTimeout(path.to_path_buf()));
        }
        Ok(IndexLock {
            registry: Arc::clone(self),
            path: path.to_path_buf(),
            token,
            mode,
            held: true,
        })
    }
}

fn not_held(path: &Path, token: OwnerToken) -> MailFtsError {
    MailFtsError::invalid_operation(format!(
        "token {token} does not hold {}",
        path.display()
    ))
}

/// A held index lock, released on drop.
#[derive(Debug)]
pub struct IndexLock {
    registry: Arc<LockRegistry>,
    path: PathBuf,
    token: OwnerToken,
    mode: LockMode,
    held: bool,
}

impl IndexLock {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn token(&self) -> OwnerToken {
        self.token
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to become exclusive without letting go of the shared hold.
    pub fn try_upgrade(&mut self) -> Result<bool> {
        let upgraded = self.registry.try_upgrade(&self.path, self.token)?;
        if upgraded {
            self.mode = LockMode::Exclusive;
        }
        Ok(upgraded)
    }

    pub fn downgrade(&mut self) -> Result<()> {
        self.registry.downgrade(&self.path, self.token)?;
        self.mode = LockMode::Shared;
        Ok(())
    }

    pub fn release(mut self) -> Result<()> {
        self.held = false;
        self.registry.release(&self.path, self.token)
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if self.held
            && let Err(e) = self.registry.release(&self.path, self.token)
        {
            log::warn!("failed to release lock {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NOW: Duration = Duration::ZERO;

    fn lock_path(dir: &TempDir) -> PathBuf {
        dir.path().join("fragment.lock")
    }

    #[test]
    fn test_shared_holders_coexist() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let registry = LockRegistry::new();
        let (a, b) = (OwnerToken::new(), OwnerToken::new());

        assert!(registry.acquire(&path, LockMode::Shared, NOW, a).unwrap());
        assert!(registry.acquire(&path, LockMode::Shared, NOW, b).unwrap());
        assert_eq!(registry.state(&path).unwrap(), Some((LockMode::Shared, 2)));

        registry.release(&path, a).unwrap();
        registry.release(&path, b).unwrap();
        assert_eq!(registry.state(&path).unwrap(), None);
    }

    #[test]
    fn test_exclusive_over_other_readers_fails_without_error() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let registry = LockRegistry::new();
        let (a, b) = (OwnerToken::new(), OwnerToken::new());

        assert!(registry.acquire(&path, LockMode::Shared, NOW, a).unwrap());
        assert!(!registry.acquire(&path, LockMode::Exclusive, NOW, b).unwrap());

        // the reader set is in this process, so there is nothing to wait for
        let started = Instant::now();
        assert!(
            !registry
                .acquire(&path, LockMode::Exclusive, Duration::from_secs(5), b)
                .unwrap()
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(registry.state(&path).unwrap(), Some((LockMode::Shared, 1)));
    }

    #[test]
    fn test_upgrade_only_as_sole_reader() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let registry = LockRegistry::new();
        let (a, b) = (OwnerToken::new(), OwnerToken::new());

        registry.acquire(&path, LockMode::Shared, NOW, a).unwrap();
        registry.acquire(&path, LockMode::Shared, NOW, b).unwrap();
        assert!(!registry.try_upgrade(&path, a).unwrap());

        registry.release(&path, b).unwrap();
        assert!(registry.try_upgrade(&path, a).unwrap());
        assert_eq!(registry.state(&path).unwrap(), Some((LockMode::Exclusive, 1)));

        // readers now wait behind the writer
        assert!(!registry.acquire(&path, LockMode::Shared, NOW, b).unwrap());

        registry.downgrade(&path, a).unwrap();
        assert!(registry.acquire(&path, LockMode::Shared, NOW, b).unwrap());
    }

    #[test]
    fn test_exclusive_upgrade_property_over_sequences() {
        // An exclusive request succeeds iff the reader set is empty or only
        // the requester itself.
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let tokens: Vec<_> = (0..3).map(|_| OwnerToken::new()).collect();

        for mask in 0u8..8 {
            let registry = LockRegistry::new();
            let readers: Vec<_> = (0..3).filter(|i| mask & (1 << i) != 0).collect();
            for &i in &readers {
                registry.acquire(&path, LockMode::Shared, NOW, tokens[i]).unwrap();
            }

            let requester = tokens[0];
            let got = if readers.contains(&0) {
                registry.try_upgrade(&path, requester).unwrap()
            } else {
                registry
                    .acquire(&path, LockMode::Exclusive, NOW, requester)
                    .unwrap()
            };
            let expected = readers.is_empty() || readers == [0];
            assert_eq!(got, expected, "readers {readers:?}");
        }
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let registry = Arc::new(LockRegistry::new());
        let (a, b) = (OwnerToken::new(), OwnerToken::new());

        assert!(registry.acquire(&path, LockMode::Exclusive, NOW, a).unwrap());

        let waiter = {
            let registry = Arc::clone(&registry);
            let path = path.clone();
            std::thread::spawn(move || {
                registry
                    .acquire(&path, LockMode::Exclusive, Duration::from_secs(5), b)
                    .unwrap()
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        registry.release(&path, a).unwrap();

        assert!(waiter.join().unwrap());
        assert_eq!(registry.state(&path).unwrap(), Some((LockMode::Exclusive, 1)));
    }

    #[test]
    fn test_separate_registries_conflict_like_processes() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let first = LockRegistry::new();
        let second = LockRegistry::new();

        assert!(first.acquire(&path, LockMode::Exclusive, NOW, OwnerToken::new()).unwrap());
        assert!(!second.acquire(&path, LockMode::Shared, NOW, OwnerToken::new()).unwrap());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let registry = Arc::new(LockRegistry::new());

        {
            let guard = registry
                .lock(&path, LockMode::Exclusive, NOW, OwnerToken::new())
                .unwrap();
            assert_eq!(guard.mode(), LockMode::Exclusive);
            let err = registry
                .lock(&path, LockMode::Shared, NOW, OwnerToken::new())
                .unwrap_err();
            assert!(matches!(err, MailFtsError::LockTimeout(_)));
        }
        assert_eq!(registry.state(&path).unwrap(), None);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "re-entered")]
    fn test_reentry_is_fatal_in_debug() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let registry = LockRegistry::new();
        let token = OwnerToken::new();

        registry.acquire(&path, LockMode::Shared, NOW, token).unwrap();
        let _ = registry.acquire(&path, LockMode::Shared, NOW, token);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_reentry_is_an_error_in_release() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let registry = LockRegistry::new();
        let token = OwnerToken::new();

        registry.acquire(&path, LockMode::Shared, NOW, token).unwrap();
        let err = registry
            .acquire(&path, LockMode::Shared, NOW, token)
            .unwrap_err();
        assert!(matches!(err, MailFtsError::LockContention(_)));
    }
}
