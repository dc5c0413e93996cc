//! Whole-file YAML database guarded by an advisory `flock`.
//!
//! Readers take a shared lock, [`DatabaseStore::transact`] takes an exclusive
//! one for the full read-mutate-write cycle. Locks are only honoured by other
//! processes that also use this store.

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::defaults::{DEFAULT_LOCK_POLL_INTERVAL_MS, DEFAULT_LOCK_TIMEOUT_SECS};
use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};
use crate::types::VmDatabase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Held flock on an open database file. Unlocks on drop, so it must be
/// declared after the `File` it guards.
struct FileLock {
    fd: RawFd,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = flock(self.fd, FlockArg::Unlock) {
            debug!("Failed to release database lock: {}", e);
        }
    }
}

/// What a rewrite needs from the open database file.
trait DatabaseFile: Read + Write + Seek {
    fn truncate(&mut self) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;
}

impl DatabaseFile for File {
    fn truncate(&mut self) -> io::Result<()> {
        self.set_len(0)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseStore {
    path: PathBuf,
    lock_timeout: Duration,
    poll_interval: Duration,
}

impl DatabaseStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_LOCK_POLL_INTERVAL_MS),
        }
    }

    pub fn from_config(config: &FleetConfig) -> Self {
        Self::new(&config.database_path)
            .with_lock_timeout(config.lock_timeout)
            .with_poll_interval(config.lock_poll_interval)
    }

    /// How long to wait for another process to release the file.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole database. A missing or empty file is an empty database.
    pub fn load(&self) -> FleetResult<VmDatabase> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No database at {:?}, starting empty", self.path);
                return Ok(VmDatabase::new());
            }
            Err(e) => return Err(FleetError::io(&self.path, e)),
        };

        let _lock = self.lock(&file, LockMode::Shared)?;
        let content = self.read(&mut file)?;
        self.parse(&content)
    }

    /// Replace the stored database with `db`.
    pub fn save(&self, db: &VmDatabase) -> FleetResult<()> {
        self.transact(|current| {
            current.clone_from(db);
            Ok(())
        })
    }

    /// Run `f` against the current database while holding an exclusive lock.
    ///
    /// The file is rewritten only when `f` succeeds; on error it is left as it
    /// was. A rewrite that fails midway puts the previous content back before
    /// returning. The lock is released on every path.
    pub fn transact<T, F>(&self, f: F) -> FleetResult<T>
    where
        F: FnOnce(&mut VmDatabase) -> FleetResult<T>,
    {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| FleetError::io(&self.path, e))?;

        let lock = self.lock(&file, LockMode::Exclusive)?;

        let original = self.read(&mut file)?;
        let mut db = self.parse(&original)?;
        let value = f(&mut db)?;
        self.write(&mut file, &db, &original)?;

        drop(lock);
        info!("Saved {} VM records to {:?}", db.len(), self.path);
        Ok(value)
    }

    fn lock(&self, file: &File, mode: LockMode) -> FleetResult<FileLock> {
        let arg = match mode {
            LockMode::Shared => FlockArg::LockSharedNonblock,
            LockMode::Exclusive => FlockArg::LockExclusiveNonblock,
        };
        let fd = file.as_raw_fd();
        let deadline = Instant::now() + self.lock_timeout;

        loop {
            match flock(fd, arg) {
                Ok(()) => {
                    debug!("Acquired {:?} lock on {:?}", mode, self.path);
                    return Ok(FileLock { fd });
                }
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                Err(errno) => return Err(FleetError::io(&self.path, errno.into())),
            }

            if Instant::now() >= deadline {
                return Err(FleetError::LockTimeout {
                    path: self.path.clone(),
                    timeout: self.lock_timeout,
                });
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn read(&self, file: &mut File) -> FleetResult<String> {
        let mut content = String::new();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_string(&mut content))
            .map_err(|e| FleetError::io(&self.path, e))?;
        Ok(content)
    }

    fn parse(&self, content: &str) -> FleetResult<VmDatabase> {
        if content.trim().is_empty() {
            return Ok(VmDatabase::new());
        }

        let db: Option<VmDatabase> =
            serde_yaml::from_str(content).map_err(|e| FleetError::MalformedDatabase {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        Ok(db.unwrap_or_default())
    }

    /// Replace the file content with `db`. Must be called with the exclusive
    /// lock held and `original` being what the file held under that lock.
    fn write<D: DatabaseFile>(
        &self,
        file: &mut D,
        db: &VmDatabase,
        original: &str,
    ) -> FleetResult<()> {
        let content = serde_yaml::to_string(db).map_err(|e| FleetError::Serialization {
            operation: "save database".to_string(),
            message: e.to_string(),
        })?;

        if let Err(e) = replace_contents(file, content.as_bytes()) {
            warn!("Failed to write {:?}, restoring previous content: {}", self.path, e);
            if let Err(restore) = replace_contents(file, original.as_bytes()) {
                error!("Failed to restore {:?}: {}", self.path, restore);
            }
            return Err(FleetError::io(&self.path, e));
        }

        Ok(())
    }
}

fn replace_contents<D: DatabaseFile>(file: &mut D, content: &[u8]) -> io::Result<()> {
    file.truncate()?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(content)?;
    file.sync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IpAssignment, MemoryUnit, NetworkClass, Ram, VmRecord};
    use std::io::Cursor;
    use tempfile::TempDir;

    /// In-memory file whose writes fail once `budget` bytes have gone
    /// through, like a disk filling up. Only the first failure is injected.
    struct FullDisk {
        inner: Cursor<Vec<u8>>,
        budget: Option<usize>,
    }

    impl FullDisk {
        fn new(content: &str, budget: usize) -> Self {
            Self {
                inner: Cursor::new(content.as_bytes().to_vec()),
                budget: Some(budget),
            }
        }

        fn content(&self) -> String {
            String::from_utf8(self.inner.get_ref().clone()).unwrap()
        }
    }

    impl Read for FullDisk {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Seek for FullDisk {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.budget {
                Some(0) => {
                    self.budget = None;
                    Err(io::Error::new(ErrorKind::Other, "No space left on device"))
                }
                Some(left) => {
                    let n = buf.len().min(left);
                    self.budget = Some(left - n);
                    self.inner.write(&buf[..n])
                }
                None => self.inner.write(buf),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl DatabaseFile for FullDisk {
        fn truncate(&mut self) -> io::Result<()> {
            self.inner.get_mut().clear();
            Ok(())
        }

        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn record(addr_id: u8) -> VmRecord {
        VmRecord {
            host: "ceto".to_string(),
            ram: Ram::new(1, MemoryUnit::GiB),
            vcpus: 1,
            disk: None,
            ip: IpAssignment(NetworkClass::Private, addr_id),
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = DatabaseStore::new(dir.path().join("vms.yaml"));

        assert!(store.load().unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_load_empty_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vms.yaml");
        std::fs::write(&path, "").unwrap();

        assert!(DatabaseStore::new(&path).load().unwrap().is_empty());
    }

    #[test]
    fn test_transact_persists_on_success() {
        let dir = TempDir::new().unwrap();
        let store = DatabaseStore::new(dir.path().join("vms.yaml"));

        let len = store
            .transact(|db| {
                db.insert("a".to_string(), record(3));
                Ok(db.len())
            })
            .unwrap();
        assert_eq!(len, 1);

        let db = store.load().unwrap();
        assert_eq!(db.get("a"), Some(&record(3)));
    }

    #[test]
    fn test_transact_does_not_persist_on_error() {
        let dir = TempDir::new().unwrap();
        let store = DatabaseStore::new(dir.path().join("vms.yaml"));
        store
            .transact(|db| {
                db.insert("a".to_string(), record(3));
                Ok(())
            })
            .unwrap();
        let before = std::fs::read_to_string(store.path()).unwrap();

        let result: FleetResult<()> = store.transact(|db| {
            db.insert("b".to_string(), record(4));
            Err(FleetError::PoolExhausted {
                network: NetworkClass::Private,
            })
        });
        assert!(result.is_err());

        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), before);
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn test_shrinking_rewrite_leaves_no_tail() {
        let dir = TempDir::new().unwrap();
        let store = DatabaseStore::new(dir.path().join("vms.yaml"));

        let mut big = VmDatabase::new();
        for i in 2..40 {
            big.insert(format!("vm{}", i), record(i));
        }
        store.save(&big).unwrap();

        let mut small = VmDatabase::new();
        small.insert("only".to_string(), record(2));
        store.save(&small).unwrap();

        assert_eq!(store.load().unwrap(), small);
    }

    #[test]
    fn test_malformed_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vms.yaml");
        std::fs::write(&path, "- just\n- a list\n").unwrap();

        let err = DatabaseStore::new(&path).load().unwrap_err();
        assert!(matches!(err, FleetError::MalformedDatabase { .. }));
    }

    #[test]
    fn test_zero_ram_record_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vms.yaml");
        std::fs::write(
            &path,
            "a:\n  host: ceto\n  ram: {amt: 0, unit: GiB}\n  vcpus: 1\n  ip: [private, 3]\n",
        )
        .unwrap();

        let err = DatabaseStore::new(&path).load().unwrap_err();
        assert!(matches!(err, FleetError::MalformedDatabase { .. }));
        assert!(err.to_string().contains("amount must be positive"));
    }

    #[test]
    fn test_lock_timeout_while_another_writer_holds_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vms.yaml");
        let holder = DatabaseStore::new(&path);
        let waiter = DatabaseStore::new(&path)
            .with_lock_timeout(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(10));

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            holder
                .transact(|db| {
                    locked_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    db.insert("held".to_string(), record(9));
                    Ok(())
                })
                .unwrap();
        });

        locked_rx.recv().unwrap();
        let err = waiter.transact(|_| Ok(())).unwrap_err();
        assert!(matches!(err, FleetError::LockTimeout { .. }));

        release_tx.send(()).unwrap();
        handle.join().unwrap();

        // lock released after the holder finished
        assert!(waiter.load().unwrap().contains_key("held"));
    }

    #[test]
    fn test_failed_rewrite_restores_previous_content() {
        let store = DatabaseStore::new("vms.yaml");

        let mut before = VmDatabase::new();
        before.insert("a".to_string(), record(3));
        let original = serde_yaml::to_string(&before).unwrap();

        let mut after = before.clone();
        for i in 4..30 {
            after.insert(format!("vm{}", i), record(i));
        }

        let mut file = FullDisk::new(&original, 16);
        let err = store.write(&mut file, &after, &original).unwrap_err();

        assert!(matches!(err, FleetError::Io { .. }));
        assert_eq!(file.content(), original);
        assert_eq!(store.parse(&file.content()).unwrap(), before);
    }
}
