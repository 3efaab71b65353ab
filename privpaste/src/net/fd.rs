//! Owned, droppable file descriptors.

use derive_more::{From, Into};
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    unistd::close,
};
use std::{
    fs::File,
    io, mem,
    os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
};

/// Wrapper for `RawFd` that closes the file descriptor when dropped.
#[derive(Debug, From, Into)]
pub struct Fd(RawFd);

impl Fd {
    /// Set or clear the close-on-exec flag.
    pub fn set_cloexec(&self, add: bool) -> io::Result<()> {
        set_cloexec(self.0, add)
    }

    /// Turn the descriptor into a `File` that owns it.
    pub fn into_file(self) -> File {
        unsafe { File::from_raw_fd(self.into_raw_fd()) }
    }
}

impl From<File> for Fd {
    fn from(file: File) -> Self {
        Self(file.into_raw_fd())
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Set or clear `FD_CLOEXEC` on a raw descriptor.
pub(crate) fn set_cloexec(fd: RawFd, add: bool) -> io::Result<()> {
    let mut flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).map_err(errno)?);
    flags.set(FdFlag::FD_CLOEXEC, add);
    fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(errno)?;
    Ok(())
}

/// Convert a `nix` error into an `io::Error` with the same errno.
pub(crate) fn errno(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}
