// LNP Node: node running lightning network protocol and generalized lightning
// channels.
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Framed, descriptor-capable connection to a worker.
//!
//! A frame is a 4-byte big-endian body length followed by the body. A
//! descriptor travels on its own as a single byte carrying `SCM_RIGHTS`.

use std::cell::RefCell;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tokio::io::unix::AsyncFd;

use crate::wire::{Message, WireError, MAX_MSG_LEN};
use crate::Error;

pub struct Transport {
    io: AsyncFd<UnixStream>,
    label: RefCell<String>,
}

impl Transport {
    /// Wraps a connected socket. Must be called from within the runtime.
    pub fn new(stream: UnixStream, label: impl ToString) -> Result<Transport, Error> {
        stream.set_nonblocking(true)?;
        Ok(Transport { io: AsyncFd::new(stream)?, label: RefCell::new(label.to_string()) })
    }

    pub fn set_label(&self, label: impl ToString) { *self.label.borrow_mut() = label.to_string() }

    /// Reads one message. `Ok(None)` means the peer closed the connection
    /// on a frame boundary; closing inside a frame is malformed.
    pub async fn read_msg(&self) -> Result<Option<Message>, Error> {
        let mut len = [0u8; 4];
        match self.read_exact(&mut len).await? {
            0 => return Ok(None),
            4 => {}
            _ => return Err(WireError::Truncated.into()),
        }
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_MSG_LEN {
            return Err(WireError::Oversized(len).into());
        }
        let mut body = vec![0u8; len];
        if self.read_exact(&mut body).await? < len {
            return Err(WireError::Truncated.into());
        }
        let msg = Message::from_body(body)?;
        trace!("{} <- {}", self.label.borrow(), msg);
        Ok(Some(msg))
    }

    pub async fn write_msg(&self, msg: &Message) -> Result<(), Error> {
        let body = msg.to_body();
        let mut frame = Vec::with_capacity(body.len() + 4);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        trace!("{} -> {}", self.label.borrow(), msg);

        let mut written = 0;
        while written < frame.len() {
            let mut guard = self.io.writable().await?;
            match guard.try_io(|inner| (&*inner.get_ref()).write(&frame[written..])) {
                Ok(Ok(0)) => return Err(Error::Closed),
                Ok(Ok(n)) => written += n,
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(err)) if err.kind() == io::ErrorKind::BrokenPipe => {
                    return Err(Error::Closed)
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_would_block) => {}
            }
        }
        Ok(())
    }

    /// Hands a descriptor over. The local copy is closed once it is sent.
    pub async fn send_fd(&self, fd: OwnedFd) -> Result<(), Error> {
        let raw = [fd.as_raw_fd()];
        let byte = [0u8];
        loop {
            let mut guard = self.io.writable().await?;
            let sent = guard.try_io(|inner| {
                let cmsg = [ControlMessage::ScmRights(&raw)];
                sendmsg::<()>(
                    inner.get_ref().as_raw_fd(),
                    &[IoSlice::new(&byte)],
                    &cmsg,
                    MsgFlags::empty(),
                    None,
                )
                .map_err(io::Error::from)
            });
            match sent {
                Ok(Ok(_)) => break,
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(err)) => return Err(err.into()),
                Err(_would_block) => {}
            }
        }
        trace!("{} -> fd {}", self.label.borrow(), raw[0]);
        Ok(())
    }

    /// Receives a single descriptor, marked close-on-exec.
    pub async fn recv_fd(&self) -> Result<OwnedFd, Error> {
        loop {
            let mut guard = self.io.readable().await?;
            let received = guard.try_io(|inner| {
                let mut byte = [0u8; 1];
                let mut iov = [IoSliceMut::new(&mut byte)];
                let mut space = nix::cmsg_space!(RawFd);
                let msg = recvmsg::<()>(
                    inner.get_ref().as_raw_fd(),
                    &mut iov,
                    Some(&mut space),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(io::Error::from)?;
                let mut fds = vec![];
                for cmsg in msg.cmsgs() {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        fds.extend(received);
                    }
                }
                Ok((msg.bytes, fds))
            });
            match received {
                Ok(Ok((bytes, fds))) => {
                    // SAFETY: the kernel has just installed these descriptors
                    // in our table and nothing else refers to them.
                    let mut fds: Vec<OwnedFd> =
                        fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }).collect();
                    // anything beyond the first one is closed here
                    fds.truncate(1);
                    return match (bytes, fds.pop()) {
                        (_, Some(fd)) => {
                            trace!("{} <- fd {}", self.label.borrow(), fd.as_raw_fd());
                            Ok(fd)
                        }
                        (0, None) => Err(Error::Closed),
                        (_, None) => Err(Error::NoDescriptor),
                    };
                }
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(err)) => return Err(err.into()),
                Err(_would_block) => {}
            }
        }
    }

    /// Shuts the connection down in both directions. Pending reads on the
    /// other side see end of stream.
    pub fn close(&self) {
        if let Err(err) = self.io.get_ref().shutdown(Shutdown::Both) {
            if err.kind() != io::ErrorKind::NotConnected {
                debug!("{}: shutdown failed: {}", self.label.borrow(), err);
            }
        }
    }

    /// Fills `buf` unless end of stream comes first; returns the number of
    /// bytes read.
    async fn read_exact(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut filled = 0;
        while filled < buf.len() {
            let mut guard = self.io.readable().await?;
            match guard.try_io(|inner| (&*inner.get_ref()).read(&mut buf[filled..])) {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(err)) if err.kind() == io::ErrorKind::ConnectionReset => break,
                Ok(Err(err)) => return Err(err.into()),
                Err(_would_block) => {}
            }
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod test {
    use std::fs::File;
    use std::io::Seek;

    use super::*;

    fn pair() -> (Transport, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (Transport::new(ours, "test").unwrap(), theirs)
    }

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reads_consecutive_frames() {
        let (transport, mut remote) = pair();
        let mut bytes = frame(&[0x0B, 0xB8, 1, 2, 3]);
        bytes.extend(frame(&[0x7F, 0xFF]));
        remote.write_all(&bytes).unwrap();

        let first = transport.read_msg().await.unwrap().unwrap();
        assert_eq!(first, Message::new(3000u16, vec![1, 2, 3]));
        let second = transport.read_msg().await.unwrap().unwrap();
        assert_eq!(second, Message::new(0x7FFFu16, vec![]));

        drop(remote);
        assert!(transport.read_msg().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn eof_inside_frame_is_malformed() {
        let (transport, mut remote) = pair();
        remote.write_all(&[0, 0, 0, 10, 0x0B, 0xB8]).unwrap();
        drop(remote);
        assert!(matches!(transport.read_msg().await, Err(Error::Malformed(WireError::Truncated))));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn typeless_body_is_malformed() {
        let (transport, mut remote) = pair();
        remote.write_all(&frame(&[7])).unwrap();
        assert!(matches!(transport.read_msg().await, Err(Error::Malformed(WireError::NoType(1)))));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn written_frames_are_length_prefixed() {
        let (transport, mut remote) = pair();
        transport.write_msg(&Message::new(1000u16, vec![9])).await.unwrap();
        let mut buf = [0u8; 7];
        remote.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 3, 0x03, 0xE8, 9]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn descriptors_pass_between_messages() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let sender = Transport::new(ours, "sender").unwrap();
        let receiver = Transport::new(theirs, "receiver").unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"handoff").unwrap();
        file.rewind().unwrap();

        sender.write_msg(&Message::new(3002u16, vec![])).await.unwrap();
        sender.send_fd(OwnedFd::from(file)).await.unwrap();
        sender.write_msg(&Message::new(3003u16, vec![])).await.unwrap();

        assert_eq!(receiver.read_msg().await.unwrap().unwrap().ty.to_u16(), 3002);
        let fd = receiver.recv_fd().await.unwrap();
        let mut text = String::new();
        File::from(fd).read_to_string(&mut text).unwrap();
        assert_eq!(text, "handoff");
        assert_eq!(receiver.read_msg().await.unwrap().unwrap().ty.to_u16(), 3003);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_ends_the_stream() {
        let (transport, mut remote) = pair();
        transport.close();
        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).unwrap(), 0);
    }
}
