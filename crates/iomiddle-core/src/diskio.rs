//! Raw positioned read/write on a borrowed, already-open file descriptor.
//!
//! Grounded on `original_source/src/io_middle.c`'s `buf_flush`, which issues
//! `pwrite(info->iofd, info->sbuf, blksize, filpos)` directly against the
//! raw fd rather than going through a buffered `FILE*` or reopening the
//! path. The middleware never owns the fd's lifecycle (the unmanaged
//! `open`/`close` does), so these helpers take a raw `i32` rather than a
//! `std::fs::File`, which would close it on drop.

use std::io;

/// Writes `buf` at absolute offset `pos`, looping over short writes the way
/// `write_all` does for a regular file handle. Returns the total byte count
/// written (equal to `buf.len()` on success).
pub fn pwrite_all(fd: i32, buf: &[u8], pos: u64) -> io::Result<u64> {
    let mut written = 0usize;
    while written < buf.len() {
        let remaining = &buf[written..];
        let offset = pos
            .checked_add(written as u64)
            .and_then(|o| libc::off_t::try_from(o).ok())
            .ok_or_else(|| io::Error::other("write offset overflow"))?;
        let n = unsafe {
            libc::pwrite(
                fd,
                remaining.as_ptr().cast(),
                remaining.len(),
                offset,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            break;
        }
        written += n as usize;
    }
    Ok(written as u64)
}

/// Reads up to `buf.len()` bytes starting at absolute offset `pos`. Returns
/// the number of bytes actually read, which may be shorter than `buf.len()`
/// at end of file (the caller, not this function, decides whether a short
/// read is an error).
pub fn pread_all(fd: i32, buf: &mut [u8], pos: u64) -> io::Result<u64> {
    let mut read = 0usize;
    while read < buf.len() {
        let remaining = &mut buf[read..];
        let offset = pos
            .checked_add(read as u64)
            .and_then(|o| libc::off_t::try_from(o).ok())
            .ok_or_else(|| io::Error::other("read offset overflow"))?;
        let n = unsafe {
            libc::pread(
                fd,
                remaining.as_mut_ptr().cast(),
                remaining.len(),
                offset,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            break;
        }
        read += n as usize;
    }
    Ok(read as u64)
}
