// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;

use crate::message::VfioUserDeviceInfo;
use crate::message::VfioUserIrqInfo;

/// Result of a device operation. Failures carry an OS error code that is
/// relayed to the client in an error reply; they do not fail the connection.
pub type HandlerResult<T> = std::result::Result<T, io::Error>;

/// Operations a device model serves over a vfio-user connection.
///
/// A [`DeviceServer`](crate::DeviceServer) decodes requests from the socket
/// and routes them to these methods.
pub trait Device {
    /// Returns the basic device description: device kind flags plus region
    /// and interrupt counts. `argsz` is filled in by the server.
    fn get_device_info(&mut self) -> HandlerResult<VfioUserDeviceInfo>;

    /// Writes a [`VfioUserRegionInfo`](crate::message::VfioUserRegionInfo),
    /// followed by its capability chain when the region has one, into `buf`
    /// and returns the authoritative total size in bytes.
    ///
    /// When the returned size exceeds `buf.len()` the caller retries once
    /// with a buffer of at least the returned size; the device must fill in
    /// whatever prefix fits meanwhile.
    fn get_region_info(&mut self, index: u32, buf: &mut [u8]) -> HandlerResult<u32>;

    /// Returns information about the interrupt at `index`. `argsz` is filled
    /// in by the server.
    fn get_irq_info(&mut self, index: u32) -> HandlerResult<VfioUserIrqInfo>;

    /// Resets the device.
    fn reset(&mut self) -> HandlerResult<()>;
}

impl<D: Device + ?Sized> Device for Box<D> {
    fn get_device_info(&mut self) -> HandlerResult<VfioUserDeviceInfo> {
        (**self).get_device_info()
    }

    fn get_region_info(&mut self, index: u32, buf: &mut [u8]) -> HandlerResult<u32> {
        (**self).get_region_info(index, buf)
    }

    fn get_irq_info(&mut self, index: u32) -> HandlerResult<VfioUserIrqInfo> {
        (**self).get_irq_info(index)
    }

    fn reset(&mut self) -> HandlerResult<()> {
        (**self).reset()
    }
}
