//! File-backed `SourceIngest`: a non-blocking local path read directly
//! into the NAL parser. Closing a file source is always permanent.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::PlayerError;
use crate::parser::{FrameSink, NalParser};

use super::{IdleTimer, IngestEvent, SourceIngest};

const READ_CHUNK: usize = 64 * 1024;

pub struct FileIngest {
    path: PathBuf,
    fd: Option<RawFd>,
    read_suspended: bool,
    idle: IdleTimer,
    buf: [u8; READ_CHUNK],
}

impl FileIngest {
    pub fn new(path: PathBuf, idle_timeout: Duration) -> Self {
        Self {
            path,
            fd: None,
            read_suspended: false,
            idle: IdleTimer::new(idle_timeout),
            buf: [0u8; READ_CHUNK],
        }
    }

    pub fn open(&mut self) -> Result<(), PlayerError> {
        let cpath = CString::new(self.path.as_os_str().as_encoded_bytes()).map_err(|_| {
            PlayerError::PermanentSource {
                stream: self.path.display().to_string(),
                reason: "path contains a NUL byte".into(),
            }
        })?;
        // SAFETY: `cpath` is a valid NUL-terminated C string for the
        // duration of this call.
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
        if fd < 0 {
            return Err(PlayerError::PermanentSource {
                stream: self.path.display().to_string(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        self.fd = Some(fd);
        self.read_suspended = false;
        self.idle.mark_progress();
        Ok(())
    }
}

impl Drop for FileIngest {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

impl SourceIngest for FileIngest {
    fn open(&mut self) -> Result<(), PlayerError> {
        FileIngest::open(self)
    }

    fn poll_fd(&self) -> Option<RawFd> {
        self.fd
    }

    fn wants_read(&self) -> bool {
        self.fd.is_some() && !self.read_suspended
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn on_readable(&mut self, parser: &mut NalParser, sink: &mut dyn FrameSink) -> IngestEvent {
        let Some(fd) = self.fd else {
            return IngestEvent::Idle;
        };
        // SAFETY: `self.buf` is a valid, appropriately sized buffer for
        // the duration of the call; `fd` is owned by this `FileIngest`.
        let n = unsafe {
            libc::read(
                fd,
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
            )
        };
        if n > 0 {
            parser.feed(sink, &self.buf[..n as usize]);
            self.idle.mark_progress();
            IngestEvent::Progressed
        } else if n == 0 {
            IngestEvent::Eof
        } else {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                IngestEvent::Idle
            } else {
                IngestEvent::Transient(err.to_string())
            }
        }
    }

    fn on_writable(&mut self) -> IngestEvent {
        IngestEvent::Idle
    }

    fn suspend_read_until_next_tick(&mut self) {
        self.read_suspended = true;
    }

    fn resume_read(&mut self) {
        self.read_suspended = false;
    }

    fn idle_timed_out(&self) -> bool {
        self.idle.elapsed()
    }

    fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
        self.read_suspended = false;
    }

    fn is_reconnectable(&self) -> bool {
        false
    }
}
