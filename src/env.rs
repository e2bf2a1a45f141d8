//! File-system and scheduling services consumed by the storage core.
//!
//! The core never touches `std::fs` directly; it goes through the [`Env`]
//! capability set so tests and embedders can substitute their own I/O. The
//! default [`PosixEnv`] serves random-access reads from `pread` or, while a
//! process-wide budget lasts, from read-only memory maps.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// A file read sequentially from the front.
pub trait SequentialFile: Send {
    /// Reads into `buf`, returning the number of bytes read. The result is
    /// smaller than `buf.len()` only at end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Skips `n` bytes forward.
    fn skip(&mut self, n: u64) -> Result<()>;
}

/// A file supporting positioned reads from multiple threads.
pub trait RandomAccessFile: Send + Sync {
    /// Reads into `buf` starting at `offset`, returning the number of bytes
    /// read. The result is smaller than `buf.len()` only when the range
    /// extends past end of file.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// An append-only file with user-space buffering.
pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Pushes the user-space buffer to the kernel.
    fn flush(&mut self) -> Result<()>;

    /// Pushes buffered data all the way to stable media.
    fn sync(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// An acquired advisory lock. Release through [`Env::unlock_file`].
pub struct FileLock {
    file: File,
    path: PathBuf,
}

pub type BackgroundJob = Box<dyn FnOnce() + Send + 'static>;

/// Operating-system services used by the core.
pub trait Env: Send + Sync {
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>>;
    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>>;

    /// Creates a writable file, replacing any existing file at `path`.
    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;

    fn file_exists(&self, path: &Path) -> bool;
    fn get_children(&self, dir: &Path) -> Result<Vec<String>>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn create_dir(&self, path: &Path) -> Result<()>;
    fn remove_dir(&self, path: &Path) -> Result<()>;
    fn file_size(&self, path: &Path) -> Result<u64>;
    fn rename_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Takes an exclusive advisory lock on `path`, creating the file if
    /// needed. Fails if the lock is held by any process, this one included.
    fn lock_file(&self, path: &Path) -> Result<FileLock>;
    fn unlock_file(&self, lock: FileLock) -> Result<()>;

    /// Queues `job` on the single background worker. Jobs run in FIFO order.
    fn schedule(&self, job: BackgroundJob);

    /// Microseconds since some fixed point in the past.
    fn now_micros(&self) -> u64;

    fn sleep_for(&self, duration: Duration);
}

/// The process-wide default environment. Never torn down.
pub fn default_env() -> Arc<dyn Env> {
    static DEFAULT: OnceLock<Arc<PosixEnv>> = OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(PosixEnv::new())).clone()
}

// Paths locked by this process. The kernel's fcntl locks do not conflict
// between file descriptors of a single process, so same-process collisions
// must be caught here first.
fn locked_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static LOCKED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    LOCKED.get_or_init(|| Mutex::new(HashSet::new()))
}

// Read-only mmaps still open, counted against a fixed budget to bound
// virtual address consumption.
fn mmap_budget() -> &'static AtomicI64 {
    static REMAINING: OnceLock<AtomicI64> = OnceLock::new();
    REMAINING.get_or_init(|| {
        let allowed: i64 = if cfg!(target_pointer_width = "64") {
            1000
        } else {
            0
        };
        AtomicI64::new(allowed)
    })
}

fn acquire_mmap_slot() -> bool {
    let budget = mmap_budget();
    if budget.fetch_sub(1, Ordering::SeqCst) > 0 {
        return true;
    }
    budget.fetch_add(1, Ordering::SeqCst);
    false
}

fn release_mmap_slot() {
    mmap_budget().fetch_add(1, Ordering::SeqCst);
}

/// POSIX-backed environment.
pub struct PosixEnv {
    worker: Mutex<Option<Sender<BackgroundJob>>>,
}

impl PosixEnv {
    pub fn new() -> Self {
        PosixEnv {
            worker: Mutex::new(None),
        }
    }
}

impl Default for PosixEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Env for PosixEnv {
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        let file = File::open(path)?;
        Ok(Box::new(PosixSequentialFile { file }))
    }

    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        let file = File::open(path)?;
        if acquire_mmap_slot() {
            match MmapReadableFile::new(&file) {
                Ok(mapped) => return Ok(Box::new(mapped)),
                Err(_) => release_mmap_slot(),
            }
        }
        Ok(Box::new(PosixRandomAccessFile { file }))
    }

    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(PosixWritableFile::new(file, path.to_path_buf())))
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn get_children(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_file(path)?)
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        Ok(fs::create_dir(path)?)
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_dir(path)?)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(fs::rename(from, to)?)
    }

    fn lock_file(&self, path: &Path) -> Result<FileLock> {
        let path = path.to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        {
            let mut locked = locked_paths().lock()?;
            if !locked.insert(path.clone()) {
                return Err(Error::Io(format!(
                    "lock {}: already held by process",
                    path.display()
                )));
            }
        }

        if let Err(err) = fcntl_lock(&file, true) {
            locked_paths().lock()?.remove(&path);
            return Err(Error::Io(format!("lock {}: {err}", path.display())));
        }
        Ok(FileLock { file, path })
    }

    fn unlock_file(&self, lock: FileLock) -> Result<()> {
        let result = fcntl_lock(&lock.file, false);
        locked_paths().lock()?.remove(&lock.path);
        result.map_err(|err| Error::Io(format!("unlock {}: {err}", lock.path.display())))
    }

    fn schedule(&self, job: BackgroundJob) {
        let mut worker = self.worker.lock().unwrap();
        let sender = worker.get_or_insert_with(|| {
            let (tx, rx) = mpsc::channel::<BackgroundJob>();
            std::thread::Builder::new()
                .name("emberdb-bg".into())
                .spawn(move || {
                    for job in rx {
                        let outcome =
                            std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
                        if outcome.is_err() {
                            tracing::error!("background job panicked");
                        }
                    }
                })
                .expect("spawning background worker");
            tx
        });
        // The worker loop only ends when the sender is dropped, so the send
        // cannot fail.
        sender.send(job).expect("background worker alive");
    }

    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_micros() as u64
    }

    fn sleep_for(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

fn fcntl_lock(file: &File, lock: bool) -> std::io::Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = (if lock { libc::F_WRLCK } else { libc::F_UNLCK }) as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    // l_start = l_len = 0 locks the whole file.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

struct PosixSequentialFile {
    file: File,
}

impl SequentialFile for PosixSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        self.file.seek(SeekFrom::Current(n as i64))?;
        Ok(())
    }
}

struct PosixRandomAccessFile {
    file: File,
}

impl RandomAccessFile for PosixRandomAccessFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.file.read_at(&mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }
}

/// A read-only memory mapping of an entire file.
struct MmapReadableFile {
    base: *const u8,
    length: usize,
}

// SAFETY: the mapping is immutable for its whole lifetime and unmapped only
// in drop.
unsafe impl Send for MmapReadableFile {}
unsafe impl Sync for MmapReadableFile {}

impl MmapReadableFile {
    fn new(file: &File) -> std::io::Result<MmapReadableFile> {
        let length = file.metadata()?.len() as usize;
        if length == 0 {
            // Zero-length mmap is an error; the pread path handles these.
            return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
        }
        // SAFETY: fd is a valid open file, offset 0, PROT_READ only.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                length,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(MmapReadableFile {
            base: base as *const u8,
            length,
        })
    }
}

impl RandomAccessFile for MmapReadableFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.length {
            return Ok(0);
        }
        let n = buf.len().min(self.length - offset);
        // SAFETY: offset..offset+n is inside the mapping.
        let source = unsafe { std::slice::from_raw_parts(self.base.add(offset), n) };
        buf[..n].copy_from_slice(source);
        Ok(n)
    }
}

impl Drop for MmapReadableFile {
    fn drop(&mut self) {
        // SAFETY: base/length came from a successful mmap.
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.length) };
        release_mmap_slot();
    }
}

const WRITABLE_BUFFER_SIZE: usize = 64 * 1024;

struct PosixWritableFile {
    file: File,
    buf: Vec<u8>,
    path: PathBuf,
}

impl PosixWritableFile {
    fn new(file: File, path: PathBuf) -> Self {
        PosixWritableFile {
            file,
            buf: Vec::with_capacity(WRITABLE_BUFFER_SIZE),
            path,
        }
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.file.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    fn is_manifest(&self) -> bool {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().starts_with("MANIFEST"))
            .unwrap_or(false)
    }

    // A manifest rename/creation is only durable once the directory entry
    // itself is on disk.
    fn sync_dir_if_manifest(&self) -> Result<()> {
        if !self.is_manifest() {
            return Ok(());
        }
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        File::open(dir)?.sync_all()?;
        Ok(())
    }
}

impl WritableFile for PosixWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.buf.len() + data.len() <= WRITABLE_BUFFER_SIZE {
            self.buf.extend_from_slice(data);
            return Ok(());
        }
        self.flush_buffer()?;
        if data.len() <= WRITABLE_BUFFER_SIZE {
            self.buf.extend_from_slice(data);
            Ok(())
        } else {
            // Oversized appends go straight through.
            Ok(self.file.write_all(data)?)
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_buffer()
    }

    fn sync(&mut self) -> Result<()> {
        self.sync_dir_if_manifest()?;
        self.flush_buffer()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush_buffer()
    }
}

impl Drop for PosixWritableFile {
    fn drop(&mut self) {
        let _ = self.flush_buffer();
    }
}
