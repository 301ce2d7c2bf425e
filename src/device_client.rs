// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client side of a vfio-user connection: issues device requests and decodes
//! replies.

use std::io;
use std::mem;
use std::path::Path;

use zerocopy::FromBytes;

use crate::connection::Connection;
use crate::message::DeviceReq;
use crate::message::VfioUserDeviceInfo;
use crate::message::VfioUserIrqInfo;
use crate::message::VfioUserMsgHeader;
use crate::message::VfioUserMsgValidator;
use crate::message::VfioUserRegionInfo;
use crate::message::VfioUserU32;
use crate::Error;
use crate::Result;

/// Client for the device operations served by a remote
/// [`DeviceServer`](crate::DeviceServer).
///
/// Each method sends one request and blocks for its reply; the protocol has
/// no pipelining. An error reply from the server surfaces as
/// [`Error::ReqHandlerError`] wrapping the relayed OS error.
pub struct DeviceClient {
    connection: Connection,
}

impl DeviceClient {
    /// Creates a client on an established connection.
    pub fn new(connection: Connection) -> Self {
        DeviceClient { connection }
    }

    /// Connects to the server socket at `path`.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(Connection::connect(path)?))
    }

    /// Queries basic device information.
    pub fn get_device_info(&mut self) -> Result<VfioUserDeviceInfo> {
        let hdr = VfioUserMsgHeader::new(DeviceReq::GET_DEVICE_INFO, 0, 0);
        self.connection.send_header(&hdr, None)?;

        let body = self.recv_reply(&hdr)?;
        let info = VfioUserDeviceInfo::read_from(&body[..]).ok_or(Error::InvalidMessage)?;
        if !info.is_valid() {
            return Err(Error::InvalidMessage);
        }
        Ok(info)
    }

    /// Queries information about region `index`.
    ///
    /// Returns the fixed-size region description plus the raw capability
    /// chain bytes, which are empty when the region advertises none.
    pub fn get_region_info(&mut self, index: u32) -> Result<(VfioUserRegionInfo, Vec<u8>)> {
        let body = self.request_with_index(DeviceReq::GET_REGION_INFO, index)?;

        let info = VfioUserRegionInfo::read_from_prefix(&body[..]).ok_or(Error::InvalidMessage)?;
        if !info.is_valid() || info.argsz as usize != body.len() {
            return Err(Error::InvalidMessage);
        }
        let caps = body[mem::size_of::<VfioUserRegionInfo>()..].to_vec();
        Ok((info, caps))
    }

    /// Queries information about interrupt `index`.
    pub fn get_irq_info(&mut self, index: u32) -> Result<VfioUserIrqInfo> {
        let body = self.request_with_index(DeviceReq::GET_IRQ_INFO, index)?;

        let info = VfioUserIrqInfo::read_from(&body[..]).ok_or(Error::InvalidMessage)?;
        if !info.is_valid() {
            return Err(Error::InvalidMessage);
        }
        Ok(info)
    }

    /// Resets the device.
    pub fn reset(&mut self) -> Result<()> {
        let hdr = VfioUserMsgHeader::new(DeviceReq::RESET, 0, 0);
        self.connection.send_header(&hdr, None)?;

        let body = self.recv_reply(&hdr)?;
        if !body.is_empty() {
            return Err(Error::InvalidMessage);
        }
        Ok(())
    }

    fn request_with_index(&mut self, code: DeviceReq, index: u32) -> Result<Vec<u8>> {
        let hdr = VfioUserMsgHeader::new(code, 0, mem::size_of::<VfioUserU32>() as u32);
        self.connection
            .send_message(&hdr, &VfioUserU32::new(index), None)?;
        self.recv_reply(&hdr)
    }

    /// Receives the reply for `req` and returns its payload. An error reply
    /// is decoded into the OS error the device reported.
    fn recv_reply(&mut self, req: &VfioUserMsgHeader) -> Result<Vec<u8>> {
        let (hdr, files) = self.connection.recv_header()?;
        // No current reply carries descriptors.
        if files.is_some() {
            return Err(Error::InvalidMessage);
        }
        if !hdr.is_reply() || hdr.raw_code() != req.raw_code() {
            return Err(Error::InvalidMessage);
        }

        let body = self.connection.recv_body_bytes(&hdr)?;
        if hdr.is_error() {
            let errno = VfioUserU32::read_from(&body[..])
                .map(|e| e.value as i32)
                .unwrap_or(libc::EIO);
            return Err(Error::ReqHandlerError(io::Error::from_raw_os_error(errno)));
        }
        Ok(body)
    }
}
