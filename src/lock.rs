use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("агент уже запущен: файл блокировки {path} занят{}", pid_suffix(.pid))]
    AlreadyRunning { path: String, pid: Option<u32> },
    #[error("ошибка файла блокировки {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

fn pid_suffix(pid: &Option<u32>) -> String {
    pid.map(|p| format!(" (pid {p})")).unwrap_or_default()
}

#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "не удалось удалить файл блокировки");
            }
        }
        unlock(&self.file);
        debug!(path = %self.path.display(), "блокировка экземпляра снята");
    }
}

pub fn acquire_exclusive_lock(path: impl AsRef<Path>) -> Result<InstanceLock, LockError> {
    let path = path.as_ref();
    let io_err = |source: std::io::Error| LockError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(io_err)?;

    match try_lock(&file) {
        Ok(true) => {}
        Ok(false) => {
            let mut text = String::new();
            let pid = file
                .read_to_string(&mut text)
                .ok()
                .and_then(|_| text.trim().parse().ok());
            return Err(LockError::AlreadyRunning {
                path: path.display().to_string(),
                pid,
            });
        }
        Err(err) => return Err(io_err(err)),
    }

    write_pid(&mut file).map_err(io_err)?;

    Ok(InstanceLock {
        file,
        path: path.to_path_buf(),
    })
}

fn write_pid(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{}", std::process::id())?;
    file.flush()
}

#[cfg(unix)]
fn try_lock(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn second_instance_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run").join("tgmond.lock");

        let first = acquire_exclusive_lock(&path).expect("first lock");
        assert_eq!(
            fs::read_to_string(&path).expect("pid").trim(),
            std::process::id().to_string()
        );

        match acquire_exclusive_lock(&path) {
            Err(LockError::AlreadyRunning { pid, .. }) => {
                assert_eq!(pid, Some(std::process::id()));
            }
            other => panic!("ожидался отказ, получено {other:?}"),
        }

        drop(first);
        assert!(!path.exists());
        let again = acquire_exclusive_lock(&path).expect("lock after release");
        assert_eq!(again.path(), path.as_path());
    }
}
