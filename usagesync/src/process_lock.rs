//! Single-writer lock for the state store.
//!
//! The sync protocol assumes one process owns the client identity, the
//! sequence number and the pending counts. Commands that write them (`run`,
//! `flush`, `clear`) hold an advisory OS file lock (flock) scoped to the store
//! path for their whole lifetime. Read-only commands do not lock.
//!
//! The lock file is never removed. Deleting it on release would let a waiter
//! that already opened the old file and a newcomer that creates a fresh one
//! both hold "the" lock.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const WRITER_LOCK_FILE: &str = "usagesync.lock";

/// Held while this process owns the store
pub struct WriterGuard {
    file: File,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
    }
}

/// Take ownership of the store at `store_path`, failing if another usagesync
/// process already holds it.
pub fn acquire_writer_guard(store_path: &Path) -> Result<WriterGuard> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(store_path));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            // Owner info for debugging
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = writeln!(file, "store={}", store_path.display());
            let _ = file.flush();

            Ok(WriterGuard { file })
        }
        Err(e) if is_lock_busy(&e) => anyhow::bail!(
            "another usagesync process is using {}",
            store_path.display()
        ),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("usagesync");
    dir
}

fn scoped_lock_filename(store_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    store_path.to_string_lossy().hash(&mut hasher);
    let digest = hasher.finish();
    format!("{WRITER_LOCK_FILE}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(file.as_raw_fd(), LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("usagesync process locks currently require Unix (macOS/Linux)");
