//! Single-process lock under `running_data/`. The first process to
//! create the pid file is the main process; later workers of the same
//! deployment come up as children. A lock left behind by a dead pid
//! is taken over.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use micra_core::Result;

const LOCK_FILE: &str = "micra-main.pid";

pub struct ProcessLock {
    path: PathBuf,
    is_main_process: bool,
}

impl ProcessLock {
    pub fn acquire(running_data_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(running_data_path)?;
        let path = running_data_path.join(LOCK_FILE);
        let pid = std::process::id();

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => {
                    std::fs::write(&path, pid.to_string())?;
                    info!(pid, "acquired main-process lock");
                    return Ok(Self {
                        path,
                        is_main_process: true,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(holder) if holder == pid => {
                            return Ok(Self {
                                path,
                                is_main_process: true,
                            });
                        }
                        Some(holder) if pid_alive(holder) => {
                            info!(holder, "main-process lock held; running as child process");
                            return Ok(Self {
                                path,
                                is_main_process: false,
                            });
                        }
                        _ => {
                            warn!(path = %path.display(), "stale main-process lock; taking over");
                            let _ = std::fs::remove_file(&path);
                            continue;
                        }
                    }
                }
                Err(e) => return Err(micra_core::MicraError::from(e)),
            }
        }
    }

    pub fn is_main_process(&self) -> bool {
        self.is_main_process
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if self.is_main_process {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes process existence.
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "micra-lock-test-{}-{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn first_acquire_is_main() {
        let dir = scratch_dir();
        let lock = ProcessLock::acquire(&dir).unwrap();
        assert!(lock.is_main_process());
        assert!(dir.join(LOCK_FILE).exists());
        drop(lock);
        assert!(!dir.join(LOCK_FILE).exists());
    }

    #[test]
    fn same_pid_reacquire_stays_main() {
        let dir = scratch_dir();
        let first = ProcessLock::acquire(&dir).unwrap();
        let second = ProcessLock::acquire(&dir).unwrap();
        assert!(first.is_main_process());
        assert!(second.is_main_process());
    }

    #[test]
    fn stale_lock_taken_over() {
        let dir = scratch_dir();
        // A pid that cannot exist.
        std::fs::write(dir.join(LOCK_FILE), "4294967294").unwrap();
        let lock = ProcessLock::acquire(&dir).unwrap();
        assert!(lock.is_main_process());
    }
}
