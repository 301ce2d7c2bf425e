// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Define the data structures exchanged over a vfio-user connection.
//!
//! Every message starts with a fixed 12-byte header followed by an optional
//! payload of at most [`MAX_MSG_SIZE`] bytes. File descriptors, when a message
//! carries any, ride as ancillary data on the same `sendmsg` as the header.

use std::mem;

use bitflags::bitflags;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// Maximum number of file descriptors that can be attached to a single message.
pub const MAX_ATTACHED_FD_ENTRIES: usize = 8;

/// Maximum payload size of a single message.
pub const MAX_MSG_SIZE: usize = 0x1000;

/// Size of the fixed message header on the wire.
pub const MSG_HDR_SIZE: usize = mem::size_of::<VfioUserMsgHeader>();

/// Request codes for device operations initiated by the client.
#[repr(u32)]
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, enumn::N)]
pub enum DeviceReq {
    /// Invalid request; never dispatched.
    NONE = 0,
    /// Query basic device information.
    GET_DEVICE_INFO = 1,
    /// Query information about a device region.
    GET_REGION_INFO = 2,
    /// Query information about a device interrupt.
    GET_IRQ_INFO = 3,
    /// Reset the device.
    RESET = 4,
}

impl From<DeviceReq> for u32 {
    fn from(req: DeviceReq) -> u32 {
        req as u32
    }
}

bitflags! {
    /// Flags in the message header.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct VfioUserHeaderFlag: u32 {
        /// Message is a reply to an earlier request.
        const REPLY = 0x1;
        /// Reply carries an OS error code instead of operation data.
        const ERROR = 0x2;
    }
}

/// Common message header for each request/reply message.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct VfioUserMsgHeader {
    request: u32,
    flags: u32,
    size: u32,
}

impl VfioUserMsgHeader {
    pub fn new(request: DeviceReq, flags: u32, size: u32) -> Self {
        VfioUserMsgHeader {
            request: request.into(),
            flags,
            size,
        }
    }

    /// Returns the request code, or `None` if the peer sent a code this
    /// implementation does not know about.
    pub fn get_code(&self) -> Option<DeviceReq> {
        DeviceReq::n(self.request)
    }

    /// Returns the request code as it appeared on the wire.
    pub fn raw_code(&self) -> u32 {
        self.request
    }

    /// Returns the payload size in bytes.
    pub fn get_size(&self) -> u32 {
        self.size
    }

    pub fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    /// Is this a reply message?
    pub fn is_reply(&self) -> bool {
        self.flags & VfioUserHeaderFlag::REPLY.bits() != 0
    }

    pub fn set_reply(&mut self, is_reply: bool) {
        if is_reply {
            self.flags |= VfioUserHeaderFlag::REPLY.bits();
        } else {
            self.flags &= !VfioUserHeaderFlag::REPLY.bits();
        }
    }

    /// Does this reply carry an error code instead of operation data?
    pub fn is_error(&self) -> bool {
        self.flags & VfioUserHeaderFlag::ERROR.bits() != 0
    }

    pub fn set_error(&mut self, is_error: bool) {
        if is_error {
            self.flags |= VfioUserHeaderFlag::ERROR.bits();
        } else {
            self.flags &= !VfioUserHeaderFlag::ERROR.bits();
        }
    }

    /// Check whether the header flags are valid. Unknown request codes are
    /// left for the dispatcher to reject so it can account for attached fds.
    pub fn is_valid(&self) -> bool {
        VfioUserHeaderFlag::from_bits(self.flags).is_some()
    }
}

/// Check message validity.
pub trait VfioUserMsgValidator {
    /// Validate message syntax only. It doesn't validate message semantics
    /// such as whether a region index is within the device's region count.
    fn is_valid(&self) -> bool {
        true
    }
}

/// A single `u32` payload, used both for operation indexes in requests and for
/// OS error codes in error replies.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct VfioUserU32 {
    pub value: u32,
}

impl VfioUserU32 {
    pub fn new(value: u32) -> Self {
        VfioUserU32 { value }
    }
}

impl VfioUserMsgValidator for VfioUserU32 {}

/// Reply payload of `GET_DEVICE_INFO`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct VfioUserDeviceInfo {
    /// Size of this struct as filled by the device.
    pub argsz: u32,
    /// `VFIO_DEVICE_FLAGS_*` describing the device kind and abilities.
    pub flags: u32,
    /// Number of regions the device exposes.
    pub num_regions: u32,
    /// Number of interrupts the device exposes.
    pub num_irqs: u32,
}

impl VfioUserMsgValidator for VfioUserDeviceInfo {
    fn is_valid(&self) -> bool {
        self.argsz as usize >= mem::size_of::<Self>()
    }
}

/// Leading struct of a `GET_REGION_INFO` reply. When `cap_offset` is non-zero,
/// a capability chain follows in the same payload and `argsz` covers the total.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct VfioUserRegionInfo {
    /// Total size of the region info, capability chain included.
    pub argsz: u32,
    /// `VFIO_REGION_INFO_FLAG_*`.
    pub flags: u32,
    /// Region index this info describes.
    pub index: u32,
    /// Offset of the first capability within the payload, or zero.
    pub cap_offset: u32,
    /// Region size in bytes.
    pub size: u64,
    /// Region offset used when accessing the region through the device fd.
    pub offset: u64,
}

impl VfioUserMsgValidator for VfioUserRegionInfo {
    fn is_valid(&self) -> bool {
        self.argsz as usize >= mem::size_of::<Self>()
    }
}

/// Reply payload of `GET_IRQ_INFO`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct VfioUserIrqInfo {
    /// Size of this struct as filled by the device.
    pub argsz: u32,
    /// `VFIO_IRQ_INFO_*`.
    pub flags: u32,
    /// Interrupt index this info describes.
    pub index: u32,
    /// Number of interrupts at this index.
    pub count: u32,
}

impl VfioUserMsgValidator for VfioUserIrqInfo {
    fn is_valid(&self) -> bool {
        self.argsz as usize >= mem::size_of::<Self>()
    }
}
