use anyhow::Result;
use ash::vk;
#[cfg(feature = "log-lifetimes")]
use tracing::trace;

use super::Residency;
use crate::descriptor::{DescriptorKind, DescriptorTable};
use crate::device::{DescriptorInfo, Device, MemoryLocation, RawBufferInfo};
use crate::usage::{BufferState, BufferUsage};

#[derive(Debug, Clone)]
pub struct BufferCreateInfo {
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
    pub name: Option<String>,
}

impl BufferCreateInfo {
    /// Host visible upload buffer
    pub fn staging(size: u64) -> Self {
        Self {
            size,
            usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            location: MemoryLocation::CpuToGpu,
            name: None,
        }
    }

    /// Device local buffer read, and optionally written, by shaders
    pub fn structured(size: u64, writable: bool) -> Self {
        let mut usage = BufferUsage::TRANSFER_DST | BufferUsage::STORAGE_READ;
        if writable {
            usage |= BufferUsage::STORAGE_WRITE;
        }
        Self {
            size,
            usage,
            location: MemoryLocation::GpuOnly,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug)]
pub struct Buffer {
    handle: vk::Buffer,
    size: u64,
    usage: BufferUsage,
    location: MemoryLocation,
    name: Option<String>,
    /// State left behind by the last reconciled stream
    pub(crate) state: BufferState,
    /// SRV and UAV share one storage buffer descriptor
    slot: Option<u32>,
    pub(crate) residency: Residency,
}

impl Buffer {
    pub(crate) fn new<D: Device>(device: &mut D, info: BufferCreateInfo) -> Result<Self> {
        let handle = device.create_buffer(&RawBufferInfo {
            size: info.size,
            usage: info.usage.into(),
            location: info.location,
            name: info.name.as_deref(),
        })?;
        #[cfg(feature = "log-lifetimes")]
        trace!("Creating buffer {:?} ({:?})", handle, info.name);
        Ok(Self {
            handle,
            size: info.size,
            usage: info.usage,
            location: info.location,
            name: info.name,
            state: BufferState::UNDEFINED,
            slot: None,
            residency: Residency::default(),
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Ground truth is only advanced by cross-stream reconciliation
    pub(crate) fn set_state(&mut self, state: BufferState) {
        self.state = state;
    }

    pub fn residency(&self) -> &Residency {
        &self.residency
    }

    pub(crate) fn bind_srv<D: Device>(
        &mut self,
        device: &mut D,
        descriptors: &mut DescriptorTable,
    ) -> Result<u32> {
        assert!(
            self.usage.contains(BufferUsage::STORAGE_READ),
            "Buffer {:?} bound as SRV without STORAGE_READ usage",
            self.name
        );
        self.bind_storage(device, descriptors)
    }

    pub(crate) fn bind_uav<D: Device>(
        &mut self,
        device: &mut D,
        descriptors: &mut DescriptorTable,
    ) -> Result<u32> {
        assert!(
            self.usage.contains(BufferUsage::STORAGE_WRITE),
            "Buffer {:?} bound as UAV without STORAGE_WRITE usage",
            self.name
        );
        self.bind_storage(device, descriptors)
    }

    fn bind_storage<D: Device>(
        &mut self,
        device: &mut D,
        descriptors: &mut DescriptorTable,
    ) -> Result<u32> {
        if let Some(slot) = self.slot {
            return Ok(slot);
        }
        let bytes = device.descriptor_bytes(&DescriptorInfo::StorageBuffer {
            buffer: self.handle,
            range: self.size,
        })?;
        let slot = descriptors.acquire(DescriptorKind::StorageBuffer, bytes);
        self.slot = Some(slot);
        Ok(slot)
    }

    pub(crate) fn destroy<D: Device>(&mut self, device: &mut D, descriptors: &mut DescriptorTable) {
        if let Some(slot) = self.slot.take() {
            descriptors.release(DescriptorKind::StorageBuffer, slot);
        }
        #[cfg(feature = "log-lifetimes")]
        trace!("Destroying buffer {:?} ({:?})", self.handle, self.name);
        device.destroy_buffer(self.handle);
    }
}
