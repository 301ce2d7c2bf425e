// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side VFIO resources: containers, groups and devices backed by the
//! kernel's `/dev/vfio` interface.

use std::ffi::CString;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::mem;
use std::os::raw::c_char;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::RawFd;
use std::path::Path;

use log::warn;
use remain::sorted;
use thiserror::Error;
use vfio_sys::*;

#[sorted]
#[derive(Error, Debug)]
pub enum VfioError {
    #[error("failed to check VFIO extension: {0}")]
    CheckExtension(io::Error),
    #[error("failed to issue EEH PE operation: {0}")]
    EehPeOp(io::Error),
    #[error("failed to get group status: {0}")]
    GetGroupStatus(io::Error),
    #[error("failed to get device fd from group: {0}")]
    GroupGetDeviceFd(io::Error),
    #[error("failed to add group to container: {0}")]
    GroupSetContainer(io::Error),
    #[error("group is not viable; all devices in the group must be bound to vfio or unbound")]
    GroupViable,
    #[error("invalid device path")]
    InvalidPath,
    #[error("failed to enable container IOMMU: {0}")]
    IommuEnable(io::Error),
    #[error("failed to get IOMMU info: {0}")]
    IommuGetInfo(io::Error),
    #[error("failed to map memory for DMA: {0}")]
    IommuMapDma(io::Error),
    #[error("container IOMMU type is already set")]
    IommuTypeSet,
    #[error("failed to unmap DMA range: {0}")]
    IommuUnmapDma(io::Error),
    #[error("failed to open /dev/vfio/vfio container: {0}")]
    OpenContainer(io::Error),
    #[error("failed to open group device: {0}")]
    OpenGroup(io::Error),
    #[error("failed to set container IOMMU type: {0}")]
    SetIommu(io::Error),
    #[error("failed to register memory with the SPAPR IOMMU: {0}")]
    SpaprRegisterMemory(io::Error),
    #[error("failed to create SPAPR TCE window: {0}")]
    SpaprTceCreate(io::Error),
    #[error("failed to get SPAPR TCE info: {0}")]
    SpaprTceGetInfo(io::Error),
    #[error("failed to remove SPAPR TCE window: {0}")]
    SpaprTceRemove(io::Error),
    #[error("failed to unregister memory with the SPAPR IOMMU: {0}")]
    SpaprUnregisterMemory(io::Error),
    #[error("kernel reports unsupported VFIO API version {0}")]
    VfioApiVersion(i32),
}

impl VfioError {
    /// True when the kernel rejected a DMA map with `EBUSY`.
    pub fn is_busy(&self) -> bool {
        matches!(self, VfioError::IommuMapDma(e) if e.raw_os_error() == Some(libc::EBUSY))
    }
}

fn errno() -> io::Error {
    io::Error::last_os_error()
}

/// DMA map and unmap operations on an IOMMU backing store.
///
/// [`IommuMapper::map_dma`] layers `EBUSY` recovery over the raw
/// single-attempt operations, so implementors only provide those.
pub trait IommuMapper {
    /// Maps `size` bytes of process memory at `vaddr` into the IO virtual
    /// address space at `iova`, making exactly one attempt.
    fn map_dma_once(&self, vaddr: u64, iova: u64, size: u64, flags: u32) -> Result<(), VfioError>;

    /// Unmaps `size` bytes of the IO virtual address space at `iova`.
    fn unmap_dma(&self, iova: u64, size: u64, flags: u32) -> Result<(), VfioError>;

    /// Maps `size` bytes of process memory at `vaddr` into the IO virtual
    /// address space at `iova`.
    ///
    /// Device models remap some ranges, legacy ROM shadows among them,
    /// without an intervening unmap. When the kernel rejects the mapping
    /// with `EBUSY` the stale range is unmapped and the map retried exactly
    /// once; any other failure, including an `EBUSY` on the retry, is
    /// returned as is.
    fn map_dma(&self, vaddr: u64, iova: u64, size: u64, flags: u32) -> Result<(), VfioError> {
        match self.map_dma_once(vaddr, iova, size, flags) {
            Err(e) if e.is_busy() => {
                warn!("DMA map at iova 0x{:x} busy, unmapping and retrying", iova);
                self.unmap_dma(iova, size, 0)?;
                self.map_dma_once(vaddr, iova, size, flags)
            }
            res => res,
        }
    }
}

/// A VFIO container, the top-level object holding an IOMMU context that
/// groups attach to.
pub struct VfioContainer {
    container: File,
    iommu_type: Option<u32>,
}

const VFIO_CONTAINER_PATH: &str = "/dev/vfio/vfio";

impl VfioContainer {
    /// Opens a new container and verifies the kernel speaks the API version
    /// this crate was written against. Every later ioctl's layout depends on
    /// it, so a mismatch is refused up front.
    pub fn new() -> Result<Self, VfioError> {
        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open(VFIO_CONTAINER_PATH)
            .map_err(VfioError::OpenContainer)?;
        let container = VfioContainer {
            container,
            iommu_type: None,
        };

        let version = container.get_api_version();
        if version as u32 != VFIO_API_VERSION {
            return Err(VfioError::VfioApiVersion(version));
        }
        Ok(container)
    }

    fn get_api_version(&self) -> i32 {
        // Safe as file is vfio container fd and ioctl is defined by kernel.
        unsafe { ioctl(&self.container, VFIO_GET_API_VERSION()) }
    }

    /// Asks the kernel whether it supports `extension`, one of the
    /// `VFIO_*_IOMMU` or `VFIO_EEH` constants.
    pub fn check_extension(&self, extension: u32) -> Result<bool, VfioError> {
        // Safe as file is vfio container and make sure val is valid.
        let ret = unsafe { ioctl_with_val(&self.container, VFIO_CHECK_EXTENSION(), extension.into()) };
        if ret < 0 {
            return Err(VfioError::CheckExtension(errno()));
        }
        Ok(ret > 0)
    }

    /// Sets the IOMMU type for this container. May only be done once, after
    /// at least one group has been attached.
    pub fn set_iommu(&mut self, iommu_type: u32) -> Result<(), VfioError> {
        if self.iommu_type.is_some() {
            return Err(VfioError::IommuTypeSet);
        }
        // Safe as file is vfio container and make sure val is valid.
        let ret = unsafe { ioctl_with_val(&self.container, VFIO_SET_IOMMU(), iommu_type.into()) };
        if ret < 0 {
            return Err(VfioError::SetIommu(errno()));
        }
        self.iommu_type = Some(iommu_type);
        Ok(())
    }

    /// The IOMMU type previously set with [`VfioContainer::set_iommu`].
    pub fn iommu_type(&self) -> Option<u32> {
        self.iommu_type
    }

    /// Queries Type1 IOMMU information, notably the supported IOVA page
    /// sizes.
    pub fn iommu_get_info(&self) -> Result<vfio_iommu_type1_info, VfioError> {
        let mut info = vfio_iommu_type1_info {
            argsz: mem::size_of::<vfio_iommu_type1_info>() as u32,
            ..Default::default()
        };
        // Safe as file is vfio container, info is constructed above and the
        // kernel writes only within its argsz.
        let ret = unsafe { ioctl_with_mut_ref(&self.container, VFIO_IOMMU_GET_INFO(), &mut info) };
        if ret < 0 {
            return Err(VfioError::IommuGetInfo(errno()));
        }
        Ok(info)
    }

    /// Enables the container IOMMU. Required on SPAPR before DMA mappings
    /// are accepted; a no-op concept for Type1.
    pub fn iommu_enable(&self) -> Result<(), VfioError> {
        // Safe as file is vfio container fd and ioctl is defined by kernel.
        let ret = unsafe { ioctl(&self.container, VFIO_IOMMU_ENABLE()) };
        if ret < 0 {
            return Err(VfioError::IommuEnable(errno()));
        }
        Ok(())
    }

    /// Queries SPAPR TCE IOMMU information: the default 32-bit DMA window
    /// and dynamic window abilities.
    pub fn spapr_tce_get_info(&self) -> Result<vfio_iommu_spapr_tce_info, VfioError> {
        let mut info = vfio_iommu_spapr_tce_info {
            argsz: mem::size_of::<vfio_iommu_spapr_tce_info>() as u32,
            ..Default::default()
        };
        // Safe as file is vfio container, info is constructed above and the
        // kernel writes only within its argsz.
        let ret =
            unsafe { ioctl_with_mut_ref(&self.container, VFIO_IOMMU_SPAPR_TCE_GET_INFO(), &mut info) };
        if ret < 0 {
            return Err(VfioError::SpaprTceGetInfo(errno()));
        }
        Ok(info)
    }

    /// Registers a userspace memory range with the SPAPR IOMMU so it can be
    /// used for DMA mappings.
    pub fn spapr_register_memory(&self, vaddr: u64, size: u64) -> Result<(), VfioError> {
        let reg = vfio_iommu_spapr_register_memory {
            argsz: mem::size_of::<vfio_iommu_spapr_register_memory>() as u32,
            flags: 0,
            vaddr,
            size,
        };
        // Safe as file is vfio container and reg is constructed above.
        let ret =
            unsafe { ioctl_with_ref(&self.container, VFIO_IOMMU_SPAPR_REGISTER_MEMORY(), &reg) };
        if ret < 0 {
            return Err(VfioError::SpaprRegisterMemory(errno()));
        }
        Ok(())
    }

    /// Unregisters a memory range previously registered with
    /// [`VfioContainer::spapr_register_memory`].
    pub fn spapr_unregister_memory(&self, vaddr: u64, size: u64) -> Result<(), VfioError> {
        let reg = vfio_iommu_spapr_register_memory {
            argsz: mem::size_of::<vfio_iommu_spapr_register_memory>() as u32,
            flags: 0,
            vaddr,
            size,
        };
        // Safe as file is vfio container and reg is constructed above.
        let ret =
            unsafe { ioctl_with_ref(&self.container, VFIO_IOMMU_SPAPR_UNREGISTER_MEMORY(), &reg) };
        if ret < 0 {
            return Err(VfioError::SpaprUnregisterMemory(errno()));
        }
        Ok(())
    }

    /// Creates a dynamic TCE window and returns its start address in the IO
    /// virtual address space, chosen by the kernel.
    pub fn spapr_tce_create(
        &self,
        page_shift: u32,
        window_size: u64,
        levels: u32,
    ) -> Result<u64, VfioError> {
        let mut create = vfio_iommu_spapr_tce_create {
            argsz: mem::size_of::<vfio_iommu_spapr_tce_create>() as u32,
            page_shift,
            window_size,
            levels,
            ..Default::default()
        };
        // Safe as file is vfio container, create is constructed above and
        // the kernel only fills in start_addr.
        let ret =
            unsafe { ioctl_with_mut_ref(&self.container, VFIO_IOMMU_SPAPR_TCE_CREATE(), &mut create) };
        if ret < 0 {
            return Err(VfioError::SpaprTceCreate(errno()));
        }
        Ok(create.start_addr)
    }

    /// Removes the dynamic TCE window starting at `start_addr`.
    pub fn spapr_tce_remove(&self, start_addr: u64) -> Result<(), VfioError> {
        let remove = vfio_iommu_spapr_tce_remove {
            argsz: mem::size_of::<vfio_iommu_spapr_tce_remove>() as u32,
            flags: 0,
            start_addr,
        };
        // Safe as file is vfio container and remove is constructed above.
        let ret = unsafe { ioctl_with_ref(&self.container, VFIO_IOMMU_SPAPR_TCE_REMOVE(), &remove) };
        if ret < 0 {
            return Err(VfioError::SpaprTceRemove(errno()));
        }
        Ok(())
    }

    /// Issues an EEH operation, one of the `VFIO_EEH_PE_*` constants, on the
    /// partitionable endpoint owned by this container.
    pub fn eeh_pe_op(&self, op: u32) -> Result<(), VfioError> {
        let op = vfio_eeh_pe_op {
            argsz: mem::size_of::<vfio_eeh_pe_op>() as u32,
            flags: 0,
            op,
        };
        // Safe as file is vfio container and op is constructed above.
        let ret = unsafe { ioctl_with_ref(&self.container, VFIO_EEH_PE_OP(), &op) };
        if ret < 0 {
            return Err(VfioError::EehPeOp(errno()));
        }
        Ok(())
    }
}

impl IommuMapper for VfioContainer {
    fn map_dma_once(&self, vaddr: u64, iova: u64, size: u64, flags: u32) -> Result<(), VfioError> {
        let dma_map = vfio_iommu_type1_dma_map {
            argsz: mem::size_of::<vfio_iommu_type1_dma_map>() as u32,
            flags,
            vaddr,
            iova,
            size,
        };
        // Safe as file is vfio container, dma_map is constructed above and
        // the caller guarantees [vaddr, vaddr + size) is valid process
        // memory for the life of the mapping.
        let ret = unsafe { ioctl_with_ref(&self.container, VFIO_IOMMU_MAP_DMA(), &dma_map) };
        if ret < 0 {
            return Err(VfioError::IommuMapDma(errno()));
        }
        Ok(())
    }

    fn unmap_dma(&self, iova: u64, size: u64, flags: u32) -> Result<(), VfioError> {
        let mut dma_unmap = vfio_iommu_type1_dma_unmap {
            argsz: mem::size_of::<vfio_iommu_type1_dma_unmap>() as u32,
            flags,
            iova,
            size,
        };
        // Safe as file is vfio container and dma_unmap is constructed above.
        let ret = unsafe { ioctl_with_mut_ref(&self.container, VFIO_IOMMU_UNMAP_DMA(), &mut dma_unmap) };
        if ret < 0 {
            return Err(VfioError::IommuUnmapDma(errno()));
        }
        Ok(())
    }
}

impl AsRawFd for VfioContainer {
    fn as_raw_fd(&self) -> RawFd {
        self.container.as_raw_fd()
    }
}

/// A VFIO group, the unit of IOMMU isolation devices are assigned in.
pub struct VfioGroup {
    group: File,
}

impl VfioGroup {
    /// Opens `/dev/vfio/<id>` and checks the group is viable. A group is
    /// viable only when every device in it is bound to a vfio driver or
    /// unbound.
    pub fn new(id: u32) -> Result<Self, VfioError> {
        let group_path = format!("/dev/vfio/{}", id);
        let group = OpenOptions::new()
            .read(true)
            .write(true)
            .open(Path::new(&group_path))
            .map_err(VfioError::OpenGroup)?;

        let mut group_status = vfio_group_status {
            argsz: mem::size_of::<vfio_group_status>() as u32,
            flags: 0,
        };
        // Safe as we are the owner of group and group_status which are valid
        // values.
        let ret = unsafe { ioctl_with_mut_ref(&group, VFIO_GROUP_GET_STATUS(), &mut group_status) };
        if ret < 0 {
            return Err(VfioError::GetGroupStatus(errno()));
        }
        if group_status.flags & VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(VfioError::GroupViable);
        }

        Ok(VfioGroup { group })
    }

    /// Attaches this group to `container`. The container's IOMMU type may
    /// only be set after at least one group is attached.
    pub fn set_container(&self, container: &VfioContainer) -> Result<(), VfioError> {
        let container_raw_fd = container.as_raw_fd();
        // Safe as we are the owner of group and container_raw_fd which are
        // valid values, and we verify the ret value.
        let ret =
            unsafe { ioctl_with_ref(&self.group, VFIO_GROUP_SET_CONTAINER(), &container_raw_fd) };
        if ret < 0 {
            return Err(VfioError::GroupSetContainer(errno()));
        }
        Ok(())
    }

    /// Obtains the device fd for the device named `name`, e.g. a PCI address
    /// like `0000:02:00.0`, from this group.
    pub fn get_device(&self, name: &str) -> Result<VfioDevice, VfioError> {
        let path = CString::new(name.as_bytes()).map_err(|_| VfioError::InvalidPath)?;
        let path_ptr = path.as_ptr();

        // Safe as we are the owner of self and path_ptr which are valid
        // values.
        let ret = unsafe {
            ioctl_with_ptr(&self.group, VFIO_GROUP_GET_DEVICE_FD(), path_ptr as *const c_char)
        };
        if ret < 0 {
            return Err(VfioError::GroupGetDeviceFd(errno()));
        }

        // Safe as ret is a valid fd returned by the kernel and owned by us.
        let dev = unsafe { File::from_raw_fd(ret) };
        Ok(VfioDevice { dev })
    }
}

impl AsRawFd for VfioGroup {
    fn as_raw_fd(&self) -> RawFd {
        self.group.as_raw_fd()
    }
}

/// An open VFIO device obtained from its group with
/// [`VfioGroup::get_device`]. The raw fd is what region accesses and irq
/// plumbing operate on.
pub struct VfioDevice {
    dev: File,
}

impl VfioDevice {
    /// Consumes the device, returning the underlying file.
    pub fn into_file(self) -> File {
        self.dev
    }
}

impl AsRawFd for VfioDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.dev.as_raw_fd()
    }
}
