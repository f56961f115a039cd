//! Named-pipe log sink drained in the background so the engine never blocks on log writes.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::thread;

use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};

/// A FIFO owned by one session plus the thread that discards what the engine writes.
pub struct LogSink {
    path: PathBuf,
    drain: Option<thread::JoinHandle<()>>,
}

impl LogSink {
    /// Create the FIFO at `path` and start draining it.
    pub fn create(path: impl Into<PathBuf>) -> SessionResult<Self> {
        let path = path.into();
        make_fifo(&path).map_err(|err| {
            SessionError::LogSink(format!("mkfifo {} failed: {err}", path.display()))
        })?;

        let drain_path = path.clone();
        let drain = thread::Builder::new()
            .name("engine-log-drain".to_string())
            .spawn(move || drain_fifo(&drain_path))
            .map_err(|err| SessionError::LogSink(format!("failed to start drain: {err}")))?;
        debug!(path = %path.display(), "log sink ready");

        Ok(Self {
            path,
            drain: Some(drain),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop draining and remove the FIFO. Call only after the engine has exited.
    pub fn close(&mut self) {
        let Some(drain) = self.drain.take() else {
            return;
        };

        if !drain.is_finished() {
            // A drain still blocked in open() is released by a writer appearing.
            let _ = OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.path);
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove log fifo");
            }
        }
        if drain.is_finished() {
            let _ = drain.join();
        } else {
            debug!(path = %self.path.display(), "log drain still running, detaching");
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn make_fifo(path: &Path) -> io::Result<()> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_fifo() {
            return Ok(());
        }
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "a non-fifo file occupies the log path",
        ));
    }
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn drain_fifo(path: &Path) {
    match File::open(path) {
        Ok(mut fifo) => {
            if let Err(err) = io::copy(&mut fifo, &mut io::sink()) {
                debug!(path = %path.display(), error = %err, "log drain stopped");
            }
        }
        Err(err) => debug!(path = %path.display(), error = %err, "log drain could not open fifo"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn writes_never_block_and_fifo_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.log");
        let mut sink = LogSink::create(&path).unwrap();
        assert!(fs::symlink_metadata(&path).unwrap().file_type().is_fifo());

        {
            let mut writer = OpenOptions::new().write(true).open(sink.path()).unwrap();
            for _ in 0..1024 {
                writer.write_all(&[b'x'; 256]).unwrap();
            }
        }

        sink.close();
        assert!(!path.exists());
    }

    #[test]
    fn close_without_writer_releases_the_drain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idle.log");
        let sink = LogSink::create(&path).unwrap();
        drop(sink);
        assert!(!path.exists());
    }

    #[test]
    fn refuses_to_replace_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.log");
        fs::write(&path, b"existing").unwrap();
        assert!(matches!(
            LogSink::create(&path),
            Err(SessionError::LogSink(_))
        ));
    }
}
