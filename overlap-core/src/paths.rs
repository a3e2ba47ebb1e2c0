//! Per-user state directory layout and durable-file primitives.
//!
//! Everything the daemon persists lives under `~/.overlap/`:
//!
//! | File | Contents |
//! |------|----------|
//! | `config.json` | teams + tracer tuning |
//! | `state.json` | tracked journal files (durable byte offsets) |
//! | `cache.json` | repo rosters + memoized git remotes |
//! | `team-state.json` | merged team-state mirror |
//! | `tracer.pid` | advisory PID of the running daemon |
//! | `reload` | flag file; existence triggers a config reload |
//! | `logs/` | daemon log files |
//!
//! All durable writes go through [`write_atomic`] (temp-file-then-rename) so
//! readers never observe a half-written file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Returns the per-user state directory (`~/.overlap`).
///
/// `OVERLAP_HOME` overrides the location; tests rely on this to run against
/// a temp directory.
pub fn state_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("OVERLAP_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".overlap")
}

pub fn config_path() -> PathBuf {
    state_dir().join("config.json")
}

pub fn state_path() -> PathBuf {
    state_dir().join("state.json")
}

pub fn cache_path() -> PathBuf {
    state_dir().join("cache.json")
}

pub fn mirror_path() -> PathBuf {
    state_dir().join("team-state.json")
}

pub fn pid_path() -> PathBuf {
    state_dir().join("tracer.pid")
}

pub fn reload_flag_path() -> PathBuf {
    state_dir().join("reload")
}

pub fn log_dir() -> PathBuf {
    state_dir().join("logs")
}

/// Write `bytes` to `path` atomically: write a sibling temp file, flush, then
/// rename over the destination. The durable file is never mutated in place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Config(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(dir)?;

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Write this process's PID to `tracer.pid`.
pub fn write_pid_file() -> Result<()> {
    write_atomic(&pid_path(), format!("{}\n", std::process::id()).as_bytes())
}

/// Read the PID recorded in `tracer.pid`, if any.
pub fn read_pid_file() -> Option<u32> {
    let text = fs::read_to_string(pid_path()).ok()?;
    text.trim().parse().ok()
}

/// Remove `tracer.pid`, but only if it still names this process. A daemon
/// that crashed and was replaced must not delete its successor's PID file.
pub fn remove_pid_file_if_own() {
    if read_pid_file() == Some(std::process::id()) {
        let _ = fs::remove_file(pid_path());
    }
}

/// Advisory single-instance lock for the tracer daemon.
///
/// Held for the process lifetime via `flock`. Replaces matching-by-command-
/// line pre-kill: on OSes with advisory file locks, a second tracer simply
/// fails to start instead of hunting sibling processes.
pub struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl ProcessLock {
    /// Acquire the tracer lock, failing if another instance holds it.
    pub fn acquire() -> Result<Self> {
        let dir = state_dir();
        fs::create_dir_all(&dir)?;

        let path = dir.join("tracer.lock");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match lock_file_nonblocking(&file) {
            Ok(()) => {
                // Owner info for debugging only; the flock is authoritative.
                let _ = file.set_len(0);
                let _ = file.seek(SeekFrom::Start(0));
                let _ = writeln!(file, "pid={}", std::process::id());
                let _ = file.flush();
                Ok(Self { file, path })
            }
            Err(e) if is_lock_busy(&e) => Err(Error::Config(format!(
                "another overlap-tracer is already running (lock {} is held)",
                path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
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
compile_error!("the overlap tracer lock currently requires Unix (macOS/Linux)");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_state_dir() {
        assert!(config_path().ends_with("config.json"));
        assert!(state_path().ends_with("state.json"));
        assert!(cache_path().ends_with("cache.json"));
        assert!(mirror_path().ends_with("team-state.json"));
        assert!(pid_path().ends_with("tracer.pid"));
        assert!(log_dir().ends_with("logs"));
    }

    #[test]
    fn write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");

        write_atomic(&path, b"{\"v\":1}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":1}");

        write_atomic(&path, b"{\"v\":2}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":2}");

        // No temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }
}
