// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Structs for sending and receiving vfio-user messages over a UNIX domain
//! socket.
//!
//! Attached file descriptors are only ever bound to the `recvmsg` that
//! delivers the message header; payload bytes are collected with plain reads
//! afterwards.

use std::fs::File;
use std::io::ErrorKind;
use std::io::IoSlice;
use std::io::IoSliceMut;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::Path;

use zerocopy::AsBytes;

use crate::message::VfioUserMsgHeader;
use crate::message::MAX_ATTACHED_FD_ENTRIES;
use crate::message::MAX_MSG_SIZE;
use crate::message::MSG_HDR_SIZE;
use crate::sock_ctrl_msg::ScmSocket;
use crate::Error;
use crate::Result;

/// Listener for accepting incoming vfio-user connections.
pub struct SocketListener {
    fd: UnixListener,
}

impl SocketListener {
    /// Creates a listener bound to the socket at `path`.
    pub fn new<P: AsRef<Path>>(path: P, unlink: bool) -> Result<Self> {
        if unlink {
            let _ = std::fs::remove_file(&path);
        }
        let fd = UnixListener::bind(&path).map_err(Error::SocketError)?;
        Ok(SocketListener { fd })
    }

    /// Accepts a new incoming connection.
    ///
    /// Returns `Ok(None)` when the listener is non-blocking and no connection
    /// is pending.
    pub fn accept(&mut self) -> Result<Option<Connection>> {
        loop {
            match self.fd.accept() {
                Ok((sock, _addr)) => return Ok(Some(Connection::from(sock))),
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => return Ok(None),
                    ErrorKind::Interrupted => {}
                    _ => return Err(Error::SocketError(e)),
                },
            }
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.fd
            .set_nonblocking(nonblocking)
            .map_err(Error::SocketError)
    }
}

impl AsRawFd for SocketListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

// Advance the internal cursor of the slices.
// This is same with a nightly API `IoSlice::advance_slices` but for `&[u8]`.
fn advance_slices(bufs: &mut &mut [&[u8]], mut count: usize) {
    use std::mem::take;

    let mut idx = 0;
    for b in bufs.iter() {
        if count < b.len() {
            break;
        }
        count -= b.len();
        idx += 1;
    }
    *bufs = &mut take(bufs)[idx..];
    if !bufs.is_empty() {
        bufs[0] = &bufs[0][count..];
    }
}

// Advance the internal cursor of the slices.
// This is same with a nightly API `IoSliceMut::advance_slices` but for
// `&mut [u8]`.
fn advance_slices_mut(bufs: &mut &mut [&mut [u8]], mut count: usize) {
    use std::mem::take;

    let mut idx = 0;
    for b in bufs.iter() {
        if count < b.len() {
            break;
        }
        count -= b.len();
        idx += 1;
    }
    *bufs = &mut take(bufs)[idx..];
    if !bufs.is_empty() {
        let slice = take(&mut bufs[0]);
        let (_, remaining) = slice.split_at_mut(count);
        bufs[0] = remaining;
    }
}

/// A vfio-user connection over a UNIX stream socket.
pub struct Connection {
    sock: UnixStream,
}

impl From<UnixStream> for Connection {
    fn from(sock: UnixStream) -> Self {
        Connection { sock }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

impl Connection {
    /// Connects to the server socket at `path`.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let sock = UnixStream::connect(path).map_err(Error::SocketConnect)?;
        Ok(Connection::from(sock))
    }

    /// Creates a pair of connected connections, for tests and in-process use.
    pub fn pair() -> Result<(Connection, Connection)> {
        let (client, server) = UnixStream::pair().map_err(Error::SocketError)?;
        Ok((Connection::from(client), Connection::from(server)))
    }

    /// Sends bytes from scatter-gather vectors with optional attached file
    /// descriptors.
    fn send_iovec(&self, iovs: &[IoSlice], fds: Option<&[RawFd]>) -> Result<usize> {
        let rfds = fds.unwrap_or(&[]);
        self.sock
            .send_bufs_with_fds(iovs, rfds)
            .map_err(|e| match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::Interrupted => Error::SocketRetry(e),
                _ => Error::SocketError(e),
            })
    }

    /// Sends all bytes from scatter-gather vectors with optional attached file
    /// descriptors. Will loop until all data has been transferred.
    fn send_iovec_all(&self, mut iovs: &mut [&[u8]], mut fds: Option<&[RawFd]>) -> Result<usize> {
        let mut data_sent = 0;
        while !iovs.is_empty() {
            let iovec: Vec<IoSlice> = iovs.iter().map(|i| IoSlice::new(i)).collect();
            match self.send_iovec(&iovec, fds) {
                Ok(n) => {
                    // Descriptors go out with the first byte only.
                    fds = None;
                    data_sent += n;
                    advance_slices(&mut iovs, n);
                }
                Err(Error::SocketRetry(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(data_sent)
    }

    /// Reads bytes into the given scatter-gather vectors.
    ///
    /// When `allow_fd` is true, up to `MAX_ATTACHED_FD_ENTRIES` attached file
    /// descriptors are accepted and returned as `File`s. Receiving more than
    /// that is a protocol violation; the excess would otherwise be silently
    /// dropped by the kernel, so one extra slot is reserved to detect it.
    fn recv_into_bufs(
        &self,
        bufs: &mut [IoSliceMut],
        allow_fd: bool,
    ) -> Result<(usize, Option<Vec<File>>)> {
        let mut fd_array = if allow_fd {
            vec![0; MAX_ATTACHED_FD_ENTRIES + 1]
        } else {
            vec![]
        };
        let (bytes, fd_count) = self
            .sock
            .recv_iovecs_with_fds(bufs, &mut fd_array)
            .map_err(|e| match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::Interrupted => Error::SocketRetry(e),
                _ => Error::SocketError(e),
            })?;

        // Take ownership immediately so every error path below closes them.
        let files: Vec<File> = fd_array
            .iter()
            .take(fd_count)
            .map(|fd| {
                // Safe because the fd was just returned by recvmsg and is
                // owned by nothing else.
                unsafe { File::from_raw_fd(*fd) }
            })
            .collect();

        if bytes == 0 {
            return Err(Error::Disconnect);
        }
        if files.len() > MAX_ATTACHED_FD_ENTRIES {
            return Err(Error::IncorrectFds);
        }

        let files = if files.is_empty() { None } else { Some(files) };
        Ok((bytes, files))
    }

    /// Reads bytes into the given scatter-gather vectors with optional
    /// attached files. Will loop until all data has been transferred or the
    /// peer disconnects.
    fn recv_into_bufs_all(&self, mut bufs: &mut [&mut [u8]]) -> Result<usize> {
        let data_total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut data_read = 0;

        while (data_total - data_read) > 0 {
            let mut slices: Vec<IoSliceMut> = bufs.iter_mut().map(|b| IoSliceMut::new(b)).collect();
            match self.recv_into_bufs(&mut slices, false) {
                Ok((n, _)) => {
                    data_read += n;
                    advance_slices_mut(&mut bufs, n);
                }
                Err(Error::Disconnect) => return Ok(data_read),
                Err(Error::SocketRetry(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(data_read)
    }

    /// Sends a header-only message, with optional attached file descriptors.
    pub fn send_header(&self, hdr: &VfioUserMsgHeader, fds: Option<&[RawFd]>) -> Result<()> {
        let mut iovs = [hdr.as_bytes()];
        let bytes = self.send_iovec_all(&mut iovs[..], fds)?;
        if bytes != MSG_HDR_SIZE {
            return Err(Error::PartialMessage);
        }
        Ok(())
    }

    /// Sends a message with a fixed-size body in a single `writev`, with
    /// optional attached file descriptors.
    pub fn send_message<T: AsBytes>(
        &self,
        hdr: &VfioUserMsgHeader,
        body: &T,
        fds: Option<&[RawFd]>,
    ) -> Result<()> {
        let mut iovs = [hdr.as_bytes(), body.as_bytes()];
        let total = MSG_HDR_SIZE + std::mem::size_of::<T>();
        let bytes = self.send_iovec_all(&mut iovs[..], fds)?;
        if bytes != total {
            return Err(Error::PartialMessage);
        }
        Ok(())
    }

    /// Sends a message whose body is an opaque byte payload, with optional
    /// attached file descriptors.
    pub fn send_message_with_payload(
        &self,
        hdr: &VfioUserMsgHeader,
        payload: &[u8],
        fds: Option<&[RawFd]>,
    ) -> Result<()> {
        if payload.len() > MAX_MSG_SIZE {
            return Err(Error::OversizedMsg);
        }
        let mut iovs = [hdr.as_bytes(), payload];
        let total = MSG_HDR_SIZE + payload.len();
        let bytes = self.send_iovec_all(&mut iovs[..], fds)?;
        if bytes != total {
            return Err(Error::PartialMessage);
        }
        Ok(())
    }

    /// Receives a message header with any attached file descriptors.
    ///
    /// A short header read, unknown flag bits or an advertised payload larger
    /// than [`MAX_MSG_SIZE`] all fail the connection; attached descriptors
    /// are closed on every failure path.
    pub fn recv_header(&self) -> Result<(VfioUserMsgHeader, Option<Vec<File>>)> {
        let mut hdr = VfioUserMsgHeader::default();
        let (bytes, files) = loop {
            match self.recv_into_bufs(&mut [IoSliceMut::new(hdr.as_bytes_mut())], true) {
                Err(Error::SocketRetry(_)) => {}
                res => break res?,
            }
        };

        if bytes != MSG_HDR_SIZE {
            return Err(Error::PartialMessage);
        }
        if !hdr.is_valid() {
            return Err(Error::InvalidMessage);
        }
        if hdr.get_size() as usize > MAX_MSG_SIZE {
            return Err(Error::OversizedMsg);
        }

        Ok((hdr, files))
    }

    /// Receives the payload advertised by `hdr`, previously returned by
    /// [`Connection::recv_header`]. Returns an empty buffer for a zero-size
    /// message and fails with `PartialMessage` if the peer disconnects before
    /// the full payload arrives.
    pub fn recv_body_bytes(&self, hdr: &VfioUserMsgHeader) -> Result<Vec<u8>> {
        let len = hdr.get_size() as usize;
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; len];
        let bytes = self.recv_into_bufs_all(&mut [&mut buf[..]])?;
        if bytes != len {
            return Err(Error::PartialMessage);
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::io::Seek;
    use std::io::SeekFrom;
    use std::io::Write;

    use tempfile::tempdir;
    use tempfile::tempfile;

    use super::*;
    use crate::message::DeviceReq;
    use crate::message::VfioUserU32;

    #[test]
    fn create_listener() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sock");
        let listener = SocketListener::new(&path, true).unwrap();
        assert!(listener.as_raw_fd() > 0);
    }

    #[test]
    fn accept_connection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sock");
        let mut listener = SocketListener::new(&path, true).unwrap();
        listener.set_nonblocking(true).unwrap();

        // No incoming connection yet.
        assert!(listener.accept().unwrap().is_none());

        let _client = Connection::connect(&path).unwrap();
        let conn = listener.accept().unwrap();
        assert!(conn.is_some());
    }

    #[test]
    fn send_recv_header_only() {
        let (client, server) = Connection::pair().unwrap();

        let hdr = VfioUserMsgHeader::new(DeviceReq::RESET, 0, 0);
        client.send_header(&hdr, None).unwrap();

        let (rhdr, files) = server.recv_header().unwrap();
        assert_eq!(rhdr, hdr);
        assert!(files.is_none());
        assert!(server.recv_body_bytes(&rhdr).unwrap().is_empty());
    }

    #[test]
    fn send_recv_with_body() {
        let (client, server) = Connection::pair().unwrap();

        let hdr = VfioUserMsgHeader::new(
            DeviceReq::GET_REGION_INFO,
            0,
            std::mem::size_of::<VfioUserU32>() as u32,
        );
        client
            .send_message(&hdr, &VfioUserU32::new(7), None)
            .unwrap();

        let (rhdr, files) = server.recv_header().unwrap();
        assert!(files.is_none());
        let body = server.recv_body_bytes(&rhdr).unwrap();
        assert_eq!(body, 7u32.to_ne_bytes());
    }

    #[test]
    fn send_recv_with_files() {
        let (client, server) = Connection::pair().unwrap();

        let mut temp1 = tempfile().unwrap();
        write!(temp1, "first").unwrap();
        let mut temp2 = tempfile().unwrap();
        write!(temp2, "second").unwrap();
        let hdr = VfioUserMsgHeader::new(DeviceReq::RESET, 0, 0);
        client
            .send_header(&hdr, Some(&[temp1.as_raw_fd(), temp2.as_raw_fd()]))
            .unwrap();

        let (rhdr, files) = server.recv_header().unwrap();
        assert_eq!(rhdr, hdr);
        let files = files.unwrap();
        assert_eq!(files.len(), 2);

        // Descriptors arrive in the order they were attached.
        for (mut file, expected) in files.into_iter().zip(["first", "second"]) {
            file.seek(SeekFrom::Start(0)).unwrap();
            let mut content = String::new();
            file.read_to_string(&mut content).unwrap();
            assert_eq!(content, expected);
        }
    }

    #[test]
    fn reject_too_many_files() {
        let (client, server) = Connection::pair().unwrap();

        let temp = tempfile().unwrap();
        let fds = vec![temp.as_raw_fd(); MAX_ATTACHED_FD_ENTRIES + 1];
        let hdr = VfioUserMsgHeader::new(DeviceReq::RESET, 0, 0);
        client.send_header(&hdr, Some(&fds)).unwrap();

        match server.recv_header() {
            Err(Error::IncorrectFds) => {}
            res => panic!("expected IncorrectFds, got {:?}", res.map(|(h, _)| h)),
        }
    }

    #[test]
    fn reject_oversized_header() {
        let (client, server) = Connection::pair().unwrap();

        let hdr = VfioUserMsgHeader::new(DeviceReq::RESET, 0, MAX_MSG_SIZE as u32 + 1);
        client.send_header(&hdr, None).unwrap();

        match server.recv_header() {
            Err(Error::OversizedMsg) => {}
            res => panic!("expected OversizedMsg, got {:?}", res.map(|(h, _)| h)),
        }
    }

    #[test]
    fn reject_unknown_flags() {
        let (client, server) = Connection::pair().unwrap();

        let hdr = VfioUserMsgHeader::new(DeviceReq::RESET, 0x10, 0);
        client.send_header(&hdr, None).unwrap();

        match server.recv_header() {
            Err(Error::InvalidMessage) => {}
            res => panic!("expected InvalidMessage, got {:?}", res.map(|(h, _)| h)),
        }
    }

    #[test]
    fn partial_header_fails() {
        let (client, server) = Connection::pair().unwrap();

        client
            .send_iovec(&[IoSlice::new(&[0u8; 5])], None)
            .unwrap();
        drop(client);

        match server.recv_header() {
            Err(Error::PartialMessage) => {}
            res => panic!("expected PartialMessage, got {:?}", res.map(|(h, _)| h)),
        }
    }

    #[test]
    fn truncated_body_fails() {
        let (client, server) = Connection::pair().unwrap();

        let hdr = VfioUserMsgHeader::new(DeviceReq::GET_REGION_INFO, 0, 8);
        client
            .send_message_with_payload(&hdr, &[0u8; 3], None)
            .unwrap();
        drop(client);

        let (rhdr, _) = server.recv_header().unwrap();
        match server.recv_body_bytes(&rhdr) {
            Err(Error::PartialMessage) => {}
            res => panic!("expected PartialMessage, got {:?}", res),
        }
    }

    #[test]
    fn peer_disconnect() {
        let (client, server) = Connection::pair().unwrap();
        drop(client);

        match server.recv_header() {
            Err(Error::Disconnect) => {}
            res => panic!("expected Disconnect, got {:?}", res.map(|(h, _)| h)),
        }
    }

    #[test]
    fn advance_slices_works() {
        let mut buf1 = vec![1u8, 2, 3, 4, 5];
        let mut buf2 = vec![6u8, 7, 8, 9, 10];
        let mut buf3 = vec![11u8, 12, 13, 14, 15];
        let mut bufs = [&buf1[..], &buf2[..], &buf3[..]];
        let mut bufs = &mut bufs[..];
        advance_slices(&mut bufs, 7);
        assert_eq!(bufs[0], [8u8, 9, 10].as_ref());
        assert_eq!(bufs[1], [11u8, 12, 13, 14, 15].as_ref());

        let mut bufs = [&mut buf1[..], &mut buf2[..], &mut buf3[..]];
        let mut bufs = &mut bufs[..];
        advance_slices_mut(&mut bufs, 7);
        assert_eq!(bufs[0], [8u8, 9, 10].as_ref());
        assert_eq!(bufs[1], [11u8, 12, 13, 14, 15].as_ref());
    }
}
