//! Internal message handling between privilege-separated processes.
//!
//! Every message is a fixed-size [`Message`] header followed by a
//! bincode payload.  The header carries the total length, the message
//! type and a sequence number, so a receiver can check what it got
//! before it decodes the body.  A descriptor sent along with a message
//! travels as `SCM_RIGHTS` ancillary data and is announced by
//! [`Message::FLAG_FD`].

use crate::net::{Fd, UnixStream, UnixStreamExt};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use nix::{
    sys::socket::{shutdown, Shutdown},
    unistd::getpid,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::VecDeque,
    io::{self, Result},
    mem,
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::sync::Mutex;
use zerocopy::{AsBytes, FromBytes};

/// `imsg` handler.
#[derive(Debug)]
pub struct Handler {
    /// Async half of a UNIX socketpair.
    socket: UnixStream,
    /// Set after the stream was shut down.
    shutdown: AtomicBool,
    /// Serializes writers so that frames never interleave.
    send_lock: Mutex<()>,
    /// Buffered bytes and descriptors that were not consumed yet.
    read_state: Mutex<ReadState>,
}

#[derive(Debug, Default)]
struct ReadState {
    buffer: BytesMut,
    /// Stream offset of the first buffered byte.
    offset: u64,
    fds: VecDeque<PendingFd>,
}

/// A received descriptor and the stream bytes it arrived with.
///
/// The kernel delivers `SCM_RIGHTS` with the read that returns the
/// first byte of the sending `sendmsg`, so a descriptor belongs to the
/// frame that starts within `start..end`.
#[derive(Debug)]
struct PendingFd {
    start: u64,
    end: u64,
    fd: Fd,
}

/// A received message with its raw payload.
#[derive(Debug)]
pub struct Frame {
    /// Message header.
    pub message: Message,
    /// Descriptor that was announced by the header.
    pub fd: Option<Fd>,
    /// Undecoded payload.
    pub payload: Bytes,
}

impl Frame {
    /// Decode the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.payload).map_err(invalid_data)
    }
}

impl From<UnixStream> for Handler {
    fn from(socket: UnixStream) -> Self {
        Self {
            socket,
            shutdown: Default::default(),
            send_lock: Mutex::new(()),
            read_state: Mutex::new(ReadState {
                buffer: BytesMut::with_capacity(Self::READ_LENGTH),
                offset: 0,
                fds: VecDeque::new(),
            }),
        }
    }
}

impl Handler {
    /// Maximum length of a single message including the header.
    pub const BUFFER_LENGTH: usize = 0xffff;

    const READ_LENGTH: usize = 0x1000;

    /// Create new handler pair.
    pub fn pair() -> Result<(Self, Self)> {
        UnixStream::pair().map(|(a, b)| (a.into(), b.into()))
    }

    /// Create a connected pair of raw descriptors.
    ///
    /// Unlike [`Handler::pair`], this does not need a runtime and is
    /// used to prepare the channels before forking.
    pub fn socketpair() -> Result<(Fd, Fd)> {
        let (a, b) = std::os::unix::net::UnixStream::pair()?;
        Ok((Fd::from(a.into_raw_fd()), Fd::from(b.into_raw_fd())))
    }

    /// Create half of a handler pair from a file descriptor.
    pub fn from_raw_fd<T: IntoRawFd>(fd: T) -> Result<Handler> {
        unsafe { UnixStream::from_raw_fd(fd.into_raw_fd()).map(Into::into) }
    }

    /// Send message to remote end.
    pub async fn send_message<T: Serialize>(
        &self,
        mut message: Message,
        fd: Option<&Fd>,
        data: &T,
    ) -> Result<()> {
        if message.id < Message::RESERVED {
            return Err(io::Error::new(io::ErrorKind::Other, "Reserved message ID"));
        }
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "Handler is closed",
            ));
        }

        let data = bincode::serialize(data).map_err(invalid_data)?;
        message.pid = getpid().as_raw();
        message.length = u16::try_from(Message::HEADER_LENGTH + data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "message too long"))?;
        message.flags = if fd.is_some() {
            message.flags | Message::FLAG_FD
        } else {
            message.flags & !Message::FLAG_FD
        };

        let mut buf = BytesMut::with_capacity(message.length as usize);
        buf.put_slice(message.as_bytes());
        buf.put_slice(&data);

        let _guard = self.send_lock.lock().await;

        // The descriptor is attached to the first chunk only.
        let mut fd = fd;
        let mut offset = 0;
        while offset < buf.len() {
            let length = self.socket.send_with_fd(&buf[offset..], fd.take()).await?;
            if length == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "short message"));
            }
            offset += length;
        }

        Ok(())
    }

    /// Receive the next message from the remote end.
    ///
    /// Returns `None` if the remote end closed the channel between two
    /// messages; a close in the middle of a message is an error.
    pub async fn recv_frame(&self) -> Result<Option<Frame>> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "Handler is closed",
            ));
        }

        let mut state = self.read_state.lock().await;

        loop {
            if let Some(frame) = state.next_frame()? {
                return Ok(Some(frame));
            }

            // Read more data.  This is also our yield point in the loop.
            let mut chunk = [0u8; Self::READ_LENGTH];
            let (length, fds) = self.socket.recv_with_fds(&mut chunk).await?;
            state.queue_fds(length, fds)?;

            if length == 0 {
                if state.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "channel closed within a message",
                ));
            }
            state.buffer.extend_from_slice(&chunk[..length]);
        }
    }

    /// Receive and decode a message from the remote end.
    pub async fn recv_message<T: DeserializeOwned>(
        &self,
    ) -> Result<Option<(Message, Option<Fd>, T)>> {
        match self.recv_frame().await? {
            Some(frame) => {
                let data = frame.decode()?;
                Ok(Some((frame.message, frame.fd, data)))
            }
            None => Ok(None),
        }
    }

    /// Shut down both directions of the channel without dropping it.
    ///
    /// The remote end observes end-of-stream on its next read.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            let _ = shutdown(self.as_raw_fd(), Shutdown::Both);
        }
    }

    /// Returns true after [`Handler::shutdown`] was called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl ReadState {
    /// Queue the descriptors that arrived with the next `length` bytes.
    fn queue_fds(&mut self, length: usize, fds: Vec<Fd>) -> Result<()> {
        if fds.len() > 1 {
            return Err(invalid_data("more than one descriptor per message"));
        }
        let start = self.offset + self.buffer.len() as u64;
        for fd in fds {
            if length == 0 {
                return Err(invalid_data("descriptor without data"));
            }
            self.fds.push_back(PendingFd {
                start,
                end: start + length as u64,
                fd,
            });
        }
        Ok(())
    }

    /// Split the next complete frame off the read buffer.
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < Message::HEADER_LENGTH {
            return Ok(None);
        }

        let mut message = Message::default();
        message
            .as_bytes_mut()
            .copy_from_slice(&self.buffer[..Message::HEADER_LENGTH]);
        let message_length = message.length as usize;

        if message_length < Message::HEADER_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid message length",
            ));
        }
        if self.buffer.len() < message_length {
            return Ok(None);
        }

        let mut payload = self.buffer.split_to(message_length);
        payload.advance(Message::HEADER_LENGTH);
        let start = self.offset;
        self.offset += message_length as u64;

        let fd = if message.has_fd() {
            match self.fds.front() {
                Some(pending) if pending.start <= start => self.fds.pop_front().map(|p| p.fd),
                _ => return Err(invalid_data("announced descriptor is missing")),
            }
        } else {
            None
        };

        // Anything that arrived entirely within this frame was not
        // announced by it.  Dropping the descriptors closes them.
        if self.fds.front().map_or(false, |p| p.end <= self.offset) {
            self.fds.retain(|p| p.end > self.offset);
            return Err(invalid_data("unannounced descriptor"));
        }

        Ok(Some(Frame {
            message,
            fd,
            payload: payload.freeze(),
        }))
    }
}

impl AsRawFd for Handler {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Internal message header.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Message {
    /// Request type.
    pub id: u32,
    /// Total message length (header + payload).
    pub length: u16,
    /// Optional flags.
    pub flags: u16,
    /// Sequence number correlating a response with its request.
    pub seq: u32,
    /// Local PID.
    pub pid: libc::pid_t,
}

impl Message {
    /// Reserved IDs 0-10
    pub const RESERVED: u32 = 10;

    /// Message header length.
    pub const HEADER_LENGTH: usize = mem::size_of::<Self>();

    /// A descriptor is attached to this message.
    pub const FLAG_FD: u16 = 0x0001;

    /// Create new message header.
    pub fn new<T: Into<u32>>(id: T) -> Self {
        let length = Self::HEADER_LENGTH as u16;
        Message {
            id: id.into(),
            pid: getpid().as_raw(),
            length,
            ..Default::default()
        }
    }

    /// Set the sequence number.
    pub fn with_seq(self, seq: u32) -> Self {
        Self { seq, ..self }
    }

    pub fn has_fd(&self) -> bool {
        self.flags & Self::FLAG_FD != 0
    }
}

impl<T: Into<u32>> From<T> for Message {
    fn from(id: T) -> Self {
        Message::new(id)
    }
}

fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::{Handler, Message, ReadState};
    use crate::net::{Fd, UnixStreamExt};
    use nix::sys::stat::fstat;
    use std::{io, os::unix::io::AsRawFd};
    use zerocopy::AsBytes;

    fn inode(fd: &Fd) -> u64 {
        fstat(fd.as_raw_fd()).unwrap().st_ino as u64
    }

    #[test]
    fn test_empty_data() {
        let data = bincode::serialize(&()).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(Message::HEADER_LENGTH, 16);
        let message = Message::new(42u32).with_seq(7);
        assert_eq!(message.length as usize, Message::HEADER_LENGTH);
        assert_eq!(message.seq, 7);
        assert!(!message.has_fd());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reserved_id() {
        let (a, _b) = Handler::pair().unwrap();
        let err = a
            .send_message(Message::new(1u32), None, &())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_short_length_is_rejected() {
        let (a, b) = Handler::pair().unwrap();
        let mut message = Message::new(20u32);
        message.length = 4;
        a.socket.writable().await.unwrap();
        a.socket.try_write(message.as_bytes()).unwrap();

        let err = b.recv_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_descriptor() {
        let (a, b) = Handler::pair().unwrap();
        let mut message = Message::new(20u32);
        message.flags = Message::FLAG_FD;
        a.socket.writable().await.unwrap();
        a.socket.try_write(message.as_bytes()).unwrap();

        let err = b.recv_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_eof_within_message() {
        let (a, b) = Handler::pair().unwrap();
        let message = Message::new(20u32);
        a.socket.writable().await.unwrap();
        a.socket
            .try_write(&message.as_bytes()[..Message::HEADER_LENGTH / 2])
            .unwrap();
        drop(a);

        let err = b.recv_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_signals_eof() {
        let (a, b) = Handler::pair().unwrap();
        a.shutdown();
        assert!(a.is_shutdown());
        assert!(b.recv_frame().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unannounced_descriptor() {
        let (a, b) = Handler::pair().unwrap();
        let (smuggled, _smuggled_peer) = Handler::socketpair().unwrap();
        let (announced, _announced_peer) = Handler::socketpair().unwrap();

        // A frame without FLAG_FD that still carries a descriptor.
        let message = Message::new(20u32);
        a.socket
            .send_with_fd(message.as_bytes(), Some(&smuggled))
            .await
            .unwrap();
        a.send_message(Message::new(21u32), Some(&announced), &())
            .await
            .unwrap();

        let err = b.recv_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // The extra descriptor is gone; the next frame gets its own.
        let frame = b.recv_frame().await.unwrap().unwrap();
        assert_eq!(frame.message.id, 21);
        let fd = frame.fd.unwrap();
        assert_eq!(inode(&fd), inode(&announced));
        assert_ne!(inode(&fd), inode(&smuggled));
    }

    #[test]
    fn test_multiple_descriptors_per_read() {
        let (first, second) = Handler::socketpair().unwrap();
        let mut state = ReadState::default();
        let err = state
            .queue_fds(Message::HEADER_LENGTH, vec![first, second])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(state.fds.is_empty());
    }
}
