//! The request channel between interrupted threads and the collector.
//!
//! A plain pipe, used as a many-producer / one-consumer byte channel. The
//! write end is non-blocking so producers can post from an asynchronous
//! interruption context; the read end stays blocking and doubles as the
//! collector's idle wait. Each record is written with a single `write` call
//! and is far below `PIPE_BUF`, so concurrent producers never interleave
//! partial records.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

/// How many requests the collector pulls out of the pipe per read.
pub(crate) const READ_BATCH: usize = 256;

const REQUEST_SIZE: usize = mem::size_of::<CaptureRequest>();

/// One stack-capture request, exactly as it travels through the pipe.
///
/// Native byte order, fixed width; the layout is private to this crate.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct CaptureRequest {
    /// Control-block address of the requesting thread, see
    /// [`VmThreadRef::raw_id`](crate::VmThreadRef::raw_id).
    pub thread: usize,
    /// Program counter captured at interruption time, 0 if none.
    pub pc: usize,
    /// Sample weight, forwarded to the sink untouched.
    pub weight: u64,
}

pub(crate) struct RequestPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl RequestPipe {
    /// Creates the pipe and makes the write end non-blocking.
    pub fn new() -> io::Result<RequestPipe> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let [read_fd, write_fd] = fds;
        if unsafe { libc::fcntl(write_fd, libc::F_SETFL, libc::O_NONBLOCK) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            return Err(err);
        }
        Ok(RequestPipe { read_fd, write_fd })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }
}

/// Producer end of the request channel.
///
/// Holds the write fd in an atomic so "not started" (-1) and "closed" are
/// observable without locks; `try_send` is async-signal-safe.
pub(crate) struct RequestWriter {
    fd: AtomicI32,
}

impl RequestWriter {
    const UNSET: i32 = -1;

    pub fn new() -> RequestWriter {
        RequestWriter {
            fd: AtomicI32::new(Self::UNSET),
        }
    }

    pub fn open(&self, fd: RawFd) {
        self.fd.store(fd, Ordering::Release);
    }

    /// Closes the write end, which the blocking reader observes as
    /// end-of-stream once the pipe has drained.
    pub fn close(&self) {
        let fd = self.fd.swap(Self::UNSET, Ordering::AcqRel);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }

    /// Posts one request without blocking. Returns false if the channel is
    /// not open or the pipe is full; the caller rolls its flags back then.
    pub fn try_send(&self, request: &CaptureRequest) -> bool {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return false;
        }
        let written = unsafe {
            libc::write(
                fd,
                (request as *const CaptureRequest).cast::<libc::c_void>(),
                REQUEST_SIZE,
            )
        };
        written > 0
    }
}

impl Drop for RequestWriter {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) enum ReadOutcome {
    /// This many whole requests were read into the front of the buffer.
    Batch(usize),
    /// Interrupted or spuriously unready; read again.
    Retry,
    /// End of stream (write end closed) or a hard error; stop reading.
    Closed,
}

/// Consumer end of the request channel. The fd is owned by the sampler,
/// which closes it after the collector thread has been joined.
#[derive(Clone, Copy)]
pub(crate) struct RequestReader {
    fd: RawFd,
}

impl RequestReader {
    pub fn new(fd: RawFd) -> RequestReader {
        RequestReader { fd }
    }

    /// Blocks until at least one request is available and fills the front
    /// of `buf` with as many whole records as one read returns.
    pub fn read_batch(&self, buf: &mut [CaptureRequest; READ_BATCH]) -> ReadOutcome {
        let got = unsafe {
            libc::read(
                self.fd,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                mem::size_of_val(buf),
            )
        };
        if got > 0 {
            let got = got as usize;
            if got % REQUEST_SIZE != 0 {
                // Cannot happen with fixed-size sub-PIPE_BUF writes; drop
                // the torn tail rather than misframe everything after it.
                log::warn!(
                    "request pipe returned {} trailing bytes, discarding",
                    got % REQUEST_SIZE
                );
            }
            return ReadOutcome::Batch(got / REQUEST_SIZE);
        }
        if got == 0 {
            return ReadOutcome::Closed;
        }
        match io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => ReadOutcome::Retry,
            _ => ReadOutcome::Closed,
        }
    }
}
