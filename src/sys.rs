//! Thin wrappers over the raw syscalls used by the runtime.
//!
//! Every function here returns either an `io::Result` or the raw
//! return value of the syscall; callers decide how to report failures.

use libc::{F_GETFL, F_SETFL, O_CLOEXEC, O_NONBLOCK, S_IFMT, S_IFSOCK, close, fcntl, fstat, read, write};
use std::os::fd::RawFd;
use std::time::{SystemTime, UNIX_EPOCH};
use std::{io, mem};

/// Reads from a file descriptor into the given buffer.
///
/// Returns the number of bytes read, or a negative value on error.
pub(crate) fn sys_read(fd: RawFd, buffer: &mut [u8]) -> isize {
    unsafe { read(fd, buffer.as_mut_ptr() as *mut _, buffer.len()) }
}

/// Writes the buffer to a file descriptor.
///
/// Returns the number of bytes written, or a negative value on error.
pub(crate) fn sys_write(fd: RawFd, buffer: &[u8]) -> isize {
    unsafe { write(fd, buffer.as_ptr() as *const _, buffer.len()) }
}

/// Closes a file descriptor.
pub(crate) fn sys_close(fd: RawFd) {
    unsafe { close(fd) };
}

/// Returns the file status flags of a descriptor.
pub(crate) fn sys_get_flags(fd: RawFd) -> io::Result<i32> {
    let flags = unsafe { fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(flags)
}

/// Sets a file descriptor to non-blocking mode.
pub(crate) fn sys_set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = sys_get_flags(fd)?;
    if flags & O_NONBLOCK != 0 {
        return Ok(());
    }

    let rc = unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Creates a non-blocking, close-on-exec pipe.
///
/// Returns `(read_end, write_end)`.
pub(crate) fn sys_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];

    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), O_NONBLOCK | O_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok((fds[0], fds[1]))
}

/// Returns `true` if the descriptor refers to a socket.
pub(crate) fn sys_is_socket(fd: RawFd) -> io::Result<bool> {
    let mut stat: libc::stat = unsafe { mem::zeroed() };

    let rc = unsafe { fstat(fd, &mut stat) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(stat.st_mode & S_IFMT == S_IFSOCK)
}

/// Milliseconds since the Unix epoch, read from the wall clock.
///
/// Timers are stamped with this clock; a backwards jump is detected by
/// the timer manager rather than corrected here.
pub(crate) fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
