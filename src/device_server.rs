// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Server side of a vfio-user connection: receives requests, routes them to a
//! [`Device`] and writes replies.

use std::io;
use std::mem;
use std::os::unix::net::UnixStream;

use log::debug;
use log::error;
use zerocopy::FromBytes;

use crate::connection::Connection;
use crate::device::Device;
use crate::message::DeviceReq;
use crate::message::VfioUserDeviceInfo;
use crate::message::VfioUserHeaderFlag;
use crate::message::VfioUserIrqInfo;
use crate::message::VfioUserMsgHeader;
use crate::message::VfioUserRegionInfo;
use crate::message::VfioUserU32;
use crate::message::MAX_MSG_SIZE;
use crate::Error;
use crate::Result;

/// Serves vfio-user requests from one client connection against one device.
///
/// The protocol is strictly request/reply with no pipelining, so requests are
/// handled one at a time with [`DeviceServer::handle_request`]. A protocol
/// violation marks the connection broken; later calls fail fast with
/// [`Error::ConnectionBroken`] instead of reading from a stream whose framing
/// can no longer be trusted.
pub struct DeviceServer<D: Device> {
    connection: Connection,
    device: D,
    broken: bool,
}

impl<D: Device> DeviceServer<D> {
    /// Creates a server for `device` on an established connection.
    pub fn new(connection: Connection, device: D) -> Self {
        DeviceServer {
            connection,
            device,
            broken: false,
        }
    }

    /// Creates a server for `device` from a connected stream socket.
    pub fn from_stream(sock: UnixStream, device: D) -> Self {
        Self::new(Connection::from(sock), device)
    }

    /// Returns a reference to the device being served.
    pub fn as_ref(&self) -> &D {
        &self.device
    }

    /// True once a protocol violation has retired this connection.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Receives one request, dispatches it to the device and sends the reply.
    ///
    /// Returns `Err(Error::ClientExit)` when the client closes the connection
    /// between messages; every other error is a protocol violation and marks
    /// the connection broken. Device operation failures are not errors here;
    /// they are relayed to the client as error replies.
    pub fn handle_request(&mut self) -> Result<()> {
        if self.broken {
            return Err(Error::ConnectionBroken);
        }
        let res = self.process_message();
        match &res {
            Err(Error::ClientExit) | Ok(()) => {}
            Err(_) => self.broken = true,
        }
        res
    }

    fn process_message(&mut self) -> Result<()> {
        let (hdr, files) = match self.connection.recv_header() {
            Err(Error::Disconnect) => return Err(Error::ClientExit),
            res => res?,
        };
        let buf = self.connection.recv_body_bytes(&hdr)?;

        let code = match hdr.get_code() {
            Some(DeviceReq::NONE) | None => {
                // Close whatever descriptors rode in on the rejected request
                // and send nothing back; the client cannot tell how many
                // messages a request it never defined should produce.
                drop(files);
                return Err(Error::UnknownRequest(hdr.raw_code()));
            }
            Some(code) => code,
        };
        debug!("handle request {:?}, payload {} bytes", code, buf.len());

        // None of the device operations consume descriptors; close any that
        // were attached.
        drop(files);

        match code {
            DeviceReq::GET_DEVICE_INFO => self.get_device_info(),
            DeviceReq::GET_REGION_INFO => self.get_region_info(&buf),
            DeviceReq::GET_IRQ_INFO => self.get_irq_info(&buf),
            DeviceReq::RESET => self.reset(),
            DeviceReq::NONE => unreachable!(),
        }
    }

    fn new_reply_header(&self, code: DeviceReq, payload_size: usize) -> Result<VfioUserMsgHeader> {
        let size = u32::try_from(payload_size).map_err(Error::InvalidCastToInt)?;
        Ok(VfioUserMsgHeader::new(
            code,
            VfioUserHeaderFlag::REPLY.bits(),
            size,
        ))
    }

    /// Relays a device operation failure to the client as an error reply
    /// carrying the OS error code. The connection stays usable.
    fn send_error_reply(&mut self, code: DeviceReq, err: io::Error) -> Result<()> {
        error!("device request {:?} failed: {}", code, err);
        let errno = err.raw_os_error().unwrap_or(libc::EIO);
        let mut hdr = self.new_reply_header(code, mem::size_of::<VfioUserU32>())?;
        hdr.set_error(true);
        self.connection
            .send_message(&hdr, &VfioUserU32::new(errno as u32), None)
    }

    // Any request payload is ignored; only the indexed queries constrain
    // their body.
    fn get_device_info(&mut self) -> Result<()> {
        match self.device.get_device_info() {
            Ok(mut info) => {
                info.argsz = mem::size_of::<VfioUserDeviceInfo>() as u32;
                let reply = self.new_reply_header(
                    DeviceReq::GET_DEVICE_INFO,
                    mem::size_of::<VfioUserDeviceInfo>(),
                )?;
                self.connection.send_message(&reply, &info, None)
            }
            Err(e) => self.send_error_reply(DeviceReq::GET_DEVICE_INFO, e),
        }
    }

    fn get_region_info(&mut self, buf: &[u8]) -> Result<()> {
        let index = extract_index(buf)?;

        let mut region_buf = vec![0u8; mem::size_of::<VfioUserRegionInfo>()];
        // One growth is allowed. A device that still reports a larger total
        // after being handed the buffer it asked for is misbehaving.
        for _ in 0..2 {
            let total = match self.device.get_region_info(index, &mut region_buf) {
                Ok(total) => total as usize,
                Err(e) => return self.send_error_reply(DeviceReq::GET_REGION_INFO, e),
            };
            if total < mem::size_of::<VfioUserRegionInfo>() || total > MAX_MSG_SIZE {
                return Err(Error::ReqHandlerError(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "region info size out of bounds",
                )));
            }
            if total <= region_buf.len() {
                let reply = self.new_reply_header(DeviceReq::GET_REGION_INFO, total)?;
                return self
                    .connection
                    .send_message_with_payload(&reply, &region_buf[..total], None);
            }
            region_buf.resize(total, 0);
        }
        Err(Error::ReqHandlerError(io::Error::new(
            io::ErrorKind::InvalidData,
            "region info size did not converge",
        )))
    }

    fn get_irq_info(&mut self, buf: &[u8]) -> Result<()> {
        let index = extract_index(buf)?;
        match self.device.get_irq_info(index) {
            Ok(mut info) => {
                info.argsz = mem::size_of::<VfioUserIrqInfo>() as u32;
                let reply = self
                    .new_reply_header(DeviceReq::GET_IRQ_INFO, mem::size_of::<VfioUserIrqInfo>())?;
                self.connection.send_message(&reply, &info, None)
            }
            Err(e) => self.send_error_reply(DeviceReq::GET_IRQ_INFO, e),
        }
    }

    fn reset(&mut self) -> Result<()> {
        match self.device.reset() {
            Ok(()) => {
                let reply = self.new_reply_header(DeviceReq::RESET, 0)?;
                self.connection.send_header(&reply, None)
            }
            Err(e) => self.send_error_reply(DeviceReq::RESET, e),
        }
    }
}

/// Extracts the operation index from a request body that must be exactly one
/// `u32`. A mis-sized body is rejected before the device is consulted.
fn extract_index(buf: &[u8]) -> Result<u32> {
    if buf.len() != mem::size_of::<VfioUserU32>() {
        return Err(Error::InvalidMessage);
    }
    let msg = VfioUserU32::read_from(buf).ok_or(Error::InvalidMessage)?;
    Ok(msg.value)
}
