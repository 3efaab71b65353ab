//! `UnixStream` extensions to support file descriptor passing.

use crate::net::fd::{errno, Fd};
use async_trait::async_trait;
use nix::sys::{
    socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags},
    uio::IoVec,
};
use std::{
    io::{self, Result},
    os::unix::{
        io::{AsRawFd, FromRawFd, RawFd},
        net as std_net,
    },
};
use tokio::io::Interest;

pub use tokio::net::UnixStream;

/// Maximum number of descriptors accepted with a single read.
const MAX_FDS: usize = 4;

#[async_trait]
pub trait UnixStreamExt {
    /// Send `buf`, attaching `fd` as `SCM_RIGHTS` ancillary data.
    async fn send_with_fd(&self, buf: &[u8], fd: Option<&Fd>) -> Result<usize>;

    /// Receive into `buf`, returning any descriptors that arrived with it.
    async fn recv_with_fds(&self, buf: &mut [u8]) -> Result<(usize, Vec<Fd>)>;

    #[allow(clippy::missing_safety_doc)]
    unsafe fn from_raw_fd(fd: RawFd) -> Result<UnixStream>;
}

#[async_trait]
impl UnixStreamExt for UnixStream {
    async fn send_with_fd(&self, buf: &[u8], fd: Option<&Fd>) -> Result<usize> {
        let fds = fd.map(|fd| [fd.as_raw_fd()]);
        loop {
            self.writable().await?;

            match self.try_io(Interest::WRITABLE, || {
                send_fds(self.as_raw_fd(), buf, fds.as_ref().map(|fds| &fds[..]))
            }) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                result => break result,
            }
        }
    }

    async fn recv_with_fds(&self, buf: &mut [u8]) -> Result<(usize, Vec<Fd>)> {
        loop {
            self.readable().await?;

            match self.try_io(Interest::READABLE, || recv_fds(self.as_raw_fd(), buf)) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                result => break result,
            }
        }
    }

    unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        let stream = std_net::UnixStream::from_raw_fd(fd);
        stream.set_nonblocking(true)?;
        Self::from_std(stream)
    }
}

fn send_fds(socket: RawFd, buf: &[u8], fds: Option<&[RawFd]>) -> Result<usize> {
    let iov = [IoVec::from_slice(buf)];
    let rights;
    let cmsgs: &[ControlMessage<'_>] = match fds {
        Some(fds) => {
            rights = [ControlMessage::ScmRights(fds)];
            &rights
        }
        None => &[],
    };
    sendmsg(socket, &iov, cmsgs, MsgFlags::empty(), None).map_err(errno)
}

fn recv_fds(socket: RawFd, buf: &mut [u8]) -> Result<(usize, Vec<Fd>)> {
    let iov = [IoVec::from_mut_slice(buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS]);
    let message = recvmsg(socket, &iov, Some(&mut cmsg_buffer), recv_flags()).map_err(errno)?;

    // Take ownership first so that every received descriptor gets
    // closed, even if the message turns out to be unusable.
    let mut fds = vec![];
    for cmsg in message.cmsgs() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            fds.extend(received.into_iter().map(Fd::from));
        }
    }

    if message.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }

    Ok((message.bytes, fds))
}

#[cfg(any(target_os = "android", target_os = "linux"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}
