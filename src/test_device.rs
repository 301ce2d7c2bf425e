// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A deterministic in-memory device used by the crate's tests.

use std::io;

use zerocopy::AsBytes;

use crate::device::Device;
use crate::device::HandlerResult;
use crate::message::VfioUserDeviceInfo;
use crate::message::VfioUserIrqInfo;
use crate::message::VfioUserRegionInfo;

pub const TEST_NUM_REGIONS: u32 = 2;
pub const TEST_NUM_IRQS: u32 = 2;

/// Region 1 carries a capability chain; its total info size forces the
/// server's buffer to grow once.
pub const TEST_CAPS_LEN: usize = 64;
pub const TEST_CAP_BYTE: u8 = 0xa5;

const REGION_INFO_SIZE: usize = std::mem::size_of::<VfioUserRegionInfo>();

pub struct TestDevice {
    pub region_info_calls: usize,
    pub reset_count: usize,
}

impl TestDevice {
    pub fn new() -> Self {
        TestDevice {
            region_info_calls: 0,
            reset_count: 0,
        }
    }
}

impl Device for TestDevice {
    fn get_device_info(&mut self) -> HandlerResult<VfioUserDeviceInfo> {
        Ok(VfioUserDeviceInfo {
            argsz: 0,
            flags: vfio_sys::VFIO_DEVICE_FLAGS_PCI | vfio_sys::VFIO_DEVICE_FLAGS_RESET,
            num_regions: TEST_NUM_REGIONS,
            num_irqs: TEST_NUM_IRQS,
        })
    }

    fn get_region_info(&mut self, index: u32, buf: &mut [u8]) -> HandlerResult<u32> {
        self.region_info_calls += 1;
        let (info, total) = match index {
            0 => (
                VfioUserRegionInfo {
                    argsz: REGION_INFO_SIZE as u32,
                    flags: vfio_sys::VFIO_REGION_INFO_FLAG_READ
                        | vfio_sys::VFIO_REGION_INFO_FLAG_WRITE,
                    index,
                    cap_offset: 0,
                    size: 0x1000,
                    offset: 0,
                },
                REGION_INFO_SIZE,
            ),
            1 => (
                VfioUserRegionInfo {
                    argsz: (REGION_INFO_SIZE + TEST_CAPS_LEN) as u32,
                    flags: vfio_sys::VFIO_REGION_INFO_FLAG_READ
                        | vfio_sys::VFIO_REGION_INFO_FLAG_WRITE
                        | vfio_sys::VFIO_REGION_INFO_FLAG_MMAP
                        | vfio_sys::VFIO_REGION_INFO_FLAG_CAPS,
                    index,
                    cap_offset: REGION_INFO_SIZE as u32,
                    size: 0x10_0000,
                    offset: 0x1_0000,
                },
                REGION_INFO_SIZE + TEST_CAPS_LEN,
            ),
            _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        };

        // Fill in whatever prefix fits; the caller grows the buffer and
        // retries when the returned total exceeds it.
        if buf.len() >= REGION_INFO_SIZE {
            info.write_to_prefix(buf)
                .expect("buffer shorter than region info");
        }
        if buf.len() >= total {
            buf[REGION_INFO_SIZE..total].fill(TEST_CAP_BYTE);
        }
        Ok(total as u32)
    }

    fn get_irq_info(&mut self, index: u32) -> HandlerResult<VfioUserIrqInfo> {
        match index {
            0 => Ok(VfioUserIrqInfo {
                argsz: 0,
                flags: vfio_sys::VFIO_IRQ_INFO_EVENTFD,
                index,
                count: 1,
            }),
            1 => Ok(VfioUserIrqInfo {
                argsz: 0,
                flags: vfio_sys::VFIO_IRQ_INFO_EVENTFD | vfio_sys::VFIO_IRQ_INFO_MASKABLE,
                index,
                count: 3,
            }),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn reset(&mut self) -> HandlerResult<()> {
        self.reset_count += 1;
        Ok(())
    }
}
