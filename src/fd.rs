//! Thin wrappers around the few descriptor syscalls the client needs.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Fails if `fd` does not name an open descriptor.
pub(crate) fn check_open(fd: RawFd) -> io::Result<()> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();
    cvt(unsafe { libc::fstat(fd, stat.as_mut_ptr()) })?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn is_nonblocking(fd: BorrowedFd<'_>) -> io::Result<bool> {
    let flags = cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) })?;
    Ok(flags & libc::O_NONBLOCK != 0)
}

/// Clears `O_NONBLOCK` on `fd`. Leaves the flags untouched if it is not set.
pub(crate) fn set_blocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK != 0 {
        cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags & !libc::O_NONBLOCK) })?;
    }
    Ok(())
}

/// Reads a single byte. Returns the number of bytes transferred and the byte.
pub(crate) fn read_byte(fd: BorrowedFd<'_>) -> io::Result<(usize, u8)> {
    let mut buf = [0u8; 1];
    loop {
        let ret = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), 1) };
        match cvt_size(ret) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
            Ok(count) => return Ok((count, buf[0])),
        }
    }
}

/// Writes a single byte. Returns the number of bytes transferred.
pub(crate) fn write_byte(fd: BorrowedFd<'_>, byte: u8) -> io::Result<usize> {
    let buf = [byte];
    loop {
        let ret = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), 1) };
        match cvt_size(ret) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Waits until `fd` or `wake` is readable (or hung up). Returns which of the
/// two are ready.
pub(crate) fn poll_readable(
    fd: BorrowedFd<'_>,
    wake: BorrowedFd<'_>,
) -> io::Result<(bool, bool)> {
    let mut fds = [
        libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: wake.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];

    loop {
        match cvt(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) }) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
            Ok(_) => break,
        }
    }

    let ready = |pollfd: &libc::pollfd| {
        pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0
    };
    Ok((ready(&fds[0]), ready(&fds[1])))
}
