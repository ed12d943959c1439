//! CPU simulation of a [`Device`].
//!
//! Buffers are backed by host memory and copy, fill, timestamp and query
//! commands are executed at submission, so anything the core writes to the GPU
//! can be read back and inspected. Fences signal as soon as work is submitted.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use ash::vk;
use ash::vk::Handle;
#[cfg(feature = "log-lifetimes")]
use tracing::trace;

use super::{
    Capabilities, DescriptorInfo, DescriptorSizes, Device, MemoryLocation, QueryKind,
    RawBufferInfo, RawImageInfo, RawViewInfo, Submission,
};
use crate::command::Command;
use crate::descriptor::{DescriptorCapacities, DescriptorHeapLayout, DescriptorKind, DescriptorRange};
use crate::pipelines::GraphicsPipelineDesc;
use crate::resource::SamplerState;
use crate::shader::ShaderBinary;
use crate::GalError;

const DESCRIPTOR_RANGE_ALIGNMENT: u64 = 64;

#[derive(Debug, Clone)]
pub struct HeadlessDeviceConfiguration {
    pub capabilities: Capabilities,
    /// Simulated clock advance per executed command
    pub ticks_per_command: u64,
}

impl Default for HeadlessDeviceConfiguration {
    fn default() -> Self {
        Self {
            capabilities: Capabilities {
                debug_labels: true,
                mesh_shading: true,
                timestamps: true,
                pipeline_statistics: true,
                timestamp_period: 1.0,
                graphics_queue_family: 0,
                present_queue_family: 0,
                descriptor_sizes: DescriptorSizes {
                    sampled_image: 32,
                    storage_image: 32,
                    storage_buffer: 16,
                    sampler: 16,
                },
            },
            ticks_per_command: 1_000,
        }
    }
}

impl HeadlessDeviceConfiguration {
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Snapshot of one [`Device::submit`] call
#[derive(Debug, Clone)]
pub struct HeadlessSubmission {
    pub streams: Vec<Vec<Command>>,
    pub wait: Option<vk::Semaphore>,
    pub signal: Option<vk::Semaphore>,
    pub fence: vk::Fence,
}

impl HeadlessSubmission {
    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.streams.iter().flatten()
    }
}

#[derive(Debug)]
struct HeadlessBuffer {
    memory: Vec<u8>,
    location: MemoryLocation,
}

#[derive(Debug)]
struct HeadlessQueryPool {
    kind: QueryKind,
    values: Vec<u64>,
}

#[derive(Debug)]
pub struct HeadlessDevice {
    config: HeadlessDeviceConfiguration,
    next_handle: u64,
    buffers: HashMap<vk::Buffer, HeadlessBuffer>,
    images: HashSet<vk::Image>,
    views: HashSet<vk::ImageView>,
    samplers: HashSet<vk::Sampler>,
    pipelines: HashSet<vk::Pipeline>,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashSet<vk::Semaphore>,
    query_pools: HashMap<vk::QueryPool, HeadlessQueryPool>,
    clock: u64,
    fail_pipelines: bool,
    fail_submissions: bool,
    pipelines_created: usize,
    submissions: Vec<HeadlessSubmission>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(HeadlessDeviceConfiguration::default())
    }
}

impl HeadlessDevice {
    pub fn new(config: HeadlessDeviceConfiguration) -> Self {
        Self {
            config,
            next_handle: 0,
            buffers: HashMap::new(),
            images: HashSet::new(),
            views: HashSet::new(),
            samplers: HashSet::new(),
            pipelines: HashSet::new(),
            fences: HashMap::new(),
            semaphores: HashSet::new(),
            query_pools: HashMap::new(),
            clock: 0,
            fail_pipelines: false,
            fail_submissions: false,
            pipelines_created: 0,
            submissions: Vec::new(),
        }
    }

    fn allocate_handle<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    /// Registers an image owned outside the core, such as a swapchain image
    pub fn create_external_image(&mut self) -> vk::Image {
        let handle = self.allocate_handle();
        self.images.insert(handle);
        handle
    }

    /// Contents of a buffer regardless of its memory location
    pub fn read_buffer(&self, buffer: vk::Buffer) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|buffer| buffer.memory.as_slice())
    }

    /// Makes every following pipeline creation fail until toggled back
    pub fn set_fail_pipelines(&mut self, fail: bool) {
        self.fail_pipelines = fail;
    }

    /// Makes every following submission fail as a lost device would, until toggled back
    pub fn set_fail_submissions(&mut self, fail: bool) {
        self.fail_submissions = fail;
    }

    pub fn pipelines_created(&self) -> usize {
        self.pipelines_created
    }

    pub fn submissions(&self) -> &[HeadlessSubmission] {
        &self.submissions
    }

    pub fn take_submissions(&mut self) -> Vec<HeadlessSubmission> {
        std::mem::take(&mut self.submissions)
    }

    /// Number of live objects of every type, used for leak checks
    pub fn live_objects(&self) -> usize {
        self.buffers.len()
            + self.images.len()
            + self.views.len()
            + self.samplers.len()
            + self.pipelines.len()
            + self.fences.len()
            + self.semaphores.len()
            + self.query_pools.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn memory_mut(&mut self, buffer: vk::Buffer) -> Result<&mut Vec<u8>> {
        self.buffers
            .get_mut(&buffer)
            .map(|buffer| &mut buffer.memory)
            .ok_or_else(|| anyhow::Error::from(GalError::InvalidHandle))
    }

    fn execute(&mut self, command: &Command, statistics: &mut Option<(vk::QueryPool, u32)>) -> Result<()> {
        self.clock += self.config.ticks_per_command;
        match command {
            Command::CopyBuffer { src, dst, regions } => {
                for region in regions {
                    let src_range =
                        region.src_offset as usize..(region.src_offset + region.size) as usize;
                    let data = self
                        .buffers
                        .get(src)
                        .ok_or(GalError::InvalidHandle)?
                        .memory
                        .get(src_range)
                        .ok_or_else(|| anyhow::anyhow!("Copy source out of bounds"))?
                        .to_vec();
                    let dst_offset = region.dst_offset as usize;
                    self.memory_mut(*dst)?
                        .get_mut(dst_offset..dst_offset + data.len())
                        .ok_or_else(|| anyhow::anyhow!("Copy destination out of bounds"))?
                        .copy_from_slice(&data);
                }
            }
            Command::FillBuffer {
                buffer,
                offset,
                size,
                data,
            } => {
                let memory = self.memory_mut(*buffer)?;
                let end = if *size == vk::WHOLE_SIZE {
                    memory.len()
                } else {
                    (*offset + *size) as usize
                };
                let range = memory
                    .get_mut(*offset as usize..end)
                    .ok_or_else(|| anyhow::anyhow!("Fill out of bounds"))?;
                for chunk in range.chunks_mut(4) {
                    chunk.copy_from_slice(&data.to_le_bytes()[..chunk.len()]);
                }
            }
            Command::WriteTimestamp { pool, query } => {
                let clock = self.clock;
                let pool = self.query_pools.get_mut(pool).ok_or(GalError::InvalidHandle)?;
                if let Some(value) = pool.values.get_mut(*query as usize) {
                    *value = clock;
                }
            }
            Command::BeginQuery { pool, query } => {
                let pool_entry = self.query_pools.get_mut(pool).ok_or(GalError::InvalidHandle)?;
                let stride = pool_entry.kind.values_per_query();
                let start = *query as usize * stride;
                if let Some(values) = pool_entry.values.get_mut(start..start + stride) {
                    values.fill(0);
                }
                *statistics = Some((*pool, *query));
            }
            Command::EndQuery { .. } => {
                *statistics = None;
            }
            Command::Draw {
                vertex_count,
                instance_count,
                ..
            } => {
                let vertices = (*vertex_count as u64) * (*instance_count as u64);
                let primitives = (*vertex_count as u64 / 3) * (*instance_count as u64);
                self.accumulate(
                    statistics,
                    [vertices, primitives, vertices, primitives, primitives, primitives, 0],
                );
            }
            Command::DrawMeshTasks { x, y, z } => {
                let groups = (*x as u64) * (*y as u64) * (*z as u64);
                self.accumulate(statistics, [0, 0, 0, groups, groups, groups, 0]);
            }
            Command::Dispatch { x, y, z } => {
                let groups = (*x as u64) * (*y as u64) * (*z as u64);
                self.accumulate(statistics, [0, 0, 0, 0, 0, 0, groups]);
            }
            _ => {}
        }
        Ok(())
    }

    fn accumulate(
        &mut self,
        statistics: &Option<(vk::QueryPool, u32)>,
        values: [u64; crate::query::PIPELINE_STATISTICS_COUNT],
    ) {
        let Some((pool, query)) = statistics else {
            return;
        };
        if let Some(pool) = self.query_pools.get_mut(pool) {
            let start = *query as usize * values.len();
            if let Some(slots) = pool.values.get_mut(start..start + values.len()) {
                for (slot, value) in slots.iter_mut().zip(values) {
                    *slot += value;
                }
            }
        }
    }
}

impl Device for HeadlessDevice {
    fn capabilities(&self) -> &Capabilities {
        &self.config.capabilities
    }

    fn create_buffer(&mut self, info: &RawBufferInfo) -> Result<vk::Buffer> {
        let handle: vk::Buffer = self.allocate_handle();
        #[cfg(feature = "log-lifetimes")]
        trace!("Creating VkBuffer {:?} ({:?})", handle, info.name);
        self.buffers.insert(
            handle,
            HeadlessBuffer {
                memory: vec![0; info.size as usize],
                location: info.location,
            },
        );
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        #[cfg(feature = "log-lifetimes")]
        trace!("Destroying VkBuffer {:?}", buffer);
        self.buffers.remove(&buffer);
    }

    fn write_buffer(&mut self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = self.buffers.get_mut(&buffer).ok_or(GalError::InvalidHandle)?;
        if !buffer.location.is_host_visible() {
            return Err(GalError::InvalidMemoryLocation.into());
        }
        let offset = offset as usize;
        buffer
            .memory
            .get_mut(offset..offset + data.len())
            .ok_or_else(|| anyhow::anyhow!("Write out of bounds"))?
            .copy_from_slice(data);
        Ok(())
    }

    fn create_image(&mut self, _info: &RawImageInfo) -> Result<vk::Image> {
        let handle = self.allocate_handle();
        self.images.insert(handle);
        Ok(handle)
    }

    fn destroy_image(&mut self, image: vk::Image) {
        self.images.remove(&image);
    }

    fn create_image_view(&mut self, info: &RawViewInfo) -> Result<vk::ImageView> {
        if !self.images.contains(&info.image) {
            return Err(GalError::InvalidHandle.into());
        }
        let handle = self.allocate_handle();
        self.views.insert(handle);
        Ok(handle)
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        self.views.remove(&view);
    }

    fn create_sampler(&mut self, _state: &SamplerState) -> Result<vk::Sampler> {
        let handle = self.allocate_handle();
        self.samplers.insert(handle);
        Ok(handle)
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        self.samplers.remove(&sampler);
    }

    fn descriptor_heap_layout(
        &mut self,
        capacities: &DescriptorCapacities,
    ) -> Result<DescriptorHeapLayout> {
        let sizes = self.config.capabilities.descriptor_sizes;
        let mut offset = 0;
        let ranges = DescriptorKind::ALL.map(|kind| {
            let range = DescriptorRange {
                offset,
                stride: sizes.size(kind),
                capacity: capacities.capacity(kind),
            };
            offset = (range.offset + range.stride * range.capacity as u64)
                .next_multiple_of(DESCRIPTOR_RANGE_ALIGNMENT);
            range
        });
        Ok(DescriptorHeapLayout {
            size: offset,
            ranges,
        })
    }

    fn descriptor_bytes(&mut self, info: &DescriptorInfo) -> Result<Vec<u8>> {
        let kind = info.kind();
        let raw = match info {
            DescriptorInfo::SampledImage(view) | DescriptorInfo::StorageImage(view) => {
                view.as_raw()
            }
            DescriptorInfo::StorageBuffer { buffer, .. } => buffer.as_raw(),
            DescriptorInfo::Sampler(sampler) => sampler.as_raw(),
        };
        let mut bytes = vec![0u8; self.config.capabilities.descriptor_sizes.size(kind) as usize];
        // tag keeps every live descriptor distinguishable from a zeroed one
        bytes[0] = kind as u8 + 1;
        bytes[8..16].copy_from_slice(&raw.to_le_bytes());
        Ok(bytes)
    }

    fn create_graphics_pipeline(
        &mut self,
        _desc: &GraphicsPipelineDesc,
        stages: &[ShaderBinary],
    ) -> Result<vk::Pipeline> {
        if self.fail_pipelines || stages.is_empty() {
            return Err(GalError::PipelineCreation.into());
        }
        let handle = self.allocate_handle();
        self.pipelines.insert(handle);
        self.pipelines_created += 1;
        Ok(handle)
    }

    fn create_compute_pipeline(&mut self, _stage: &ShaderBinary) -> Result<vk::Pipeline> {
        if self.fail_pipelines {
            return Err(GalError::PipelineCreation.into());
        }
        let handle = self.allocate_handle();
        self.pipelines.insert(handle);
        self.pipelines_created += 1;
        Ok(handle)
    }

    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.pipelines.remove(&pipeline);
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        let handle = self.allocate_handle();
        self.fences.insert(handle, signaled);
        Ok(handle)
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        self.fences.remove(&fence);
    }

    fn wait_for_fence(&mut self, fence: vk::Fence, _timeout: u64) -> Result<()> {
        match self.fences.get(&fence) {
            Some(true) => Ok(()),
            // nothing is executing, an unsignaled fence would never signal
            Some(false) => Err(GalError::VkError(vk::Result::TIMEOUT).into()),
            None => Err(GalError::InvalidHandle.into()),
        }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        *self.fences.get_mut(&fence).ok_or(GalError::InvalidHandle)? = false;
        Ok(())
    }

    fn fence_signaled(&mut self, fence: vk::Fence) -> Result<bool> {
        Ok(*self.fences.get(&fence).ok_or(GalError::InvalidHandle)?)
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        let handle = self.allocate_handle();
        self.semaphores.insert(handle);
        Ok(handle)
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.semaphores.remove(&semaphore);
    }

    fn create_query_pool(&mut self, kind: QueryKind, count: u32) -> Result<vk::QueryPool> {
        let handle = self.allocate_handle();
        self.query_pools.insert(
            handle,
            HeadlessQueryPool {
                kind,
                values: vec![0; count as usize * kind.values_per_query()],
            },
        );
        Ok(handle)
    }

    fn destroy_query_pool(&mut self, pool: vk::QueryPool) {
        self.query_pools.remove(&pool);
    }

    fn reset_query_pool(&mut self, pool: vk::QueryPool, first: u32, count: u32) {
        if let Some(pool) = self.query_pools.get_mut(&pool) {
            let stride = pool.kind.values_per_query();
            let start = first as usize * stride;
            let end = (start + count as usize * stride).min(pool.values.len());
            if let Some(values) = pool.values.get_mut(start..end) {
                values.fill(0);
            }
        }
    }

    fn query_results(&mut self, pool: vk::QueryPool, first: u32, count: u32) -> Result<Vec<u64>> {
        let pool = self.query_pools.get(&pool).ok_or(GalError::InvalidHandle)?;
        let stride = pool.kind.values_per_query();
        let start = first as usize * stride;
        pool.values
            .get(start..start + count as usize * stride)
            .map(|values| values.to_vec())
            .ok_or_else(|| anyhow::anyhow!("Query range out of bounds"))
    }

    fn submit(&mut self, submission: Submission<'_>) -> Result<()> {
        if self.fail_submissions {
            return Err(GalError::VkError(vk::Result::ERROR_DEVICE_LOST).into());
        }
        let mut statistics = None;
        for stream in submission.streams.iter() {
            for command in stream.iter() {
                self.execute(command, &mut statistics)?;
            }
        }
        *self
            .fences
            .get_mut(&submission.fence)
            .ok_or(GalError::InvalidHandle)? = true;
        self.submissions.push(HeadlessSubmission {
            streams: submission.streams.iter().map(|stream| stream.to_vec()).collect(),
            wait: submission.wait.map(|(semaphore, _)| semaphore),
            signal: submission.signal,
            fence: submission.fence,
        });
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_buffer(device: &mut HeadlessDevice, size: u64) -> vk::Buffer {
        device
            .create_buffer(&RawBufferInfo {
                size,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
                name: None,
            })
            .unwrap()
    }

    #[test]
    fn test_copy_and_fill_execute_on_submit() {
        let mut device = HeadlessDevice::default();
        let src = host_buffer(&mut device, 8);
        let dst = host_buffer(&mut device, 8);
        let fence = device.create_fence(false).unwrap();
        device.write_buffer(src, 0, &[1, 2, 3, 4]).unwrap();
        let commands = vec![
            Command::FillBuffer {
                buffer: dst,
                offset: 0,
                size: vk::WHOLE_SIZE,
                data: 0xFFFF_FFFF,
            },
            Command::CopyBuffer {
                src,
                dst,
                regions: vec![vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 4,
                    size: 4,
                }],
            },
        ];
        device
            .submit(Submission {
                streams: vec![commands.as_slice()],
                wait: None,
                signal: None,
                fence,
            })
            .unwrap();
        assert_eq!(
            device.read_buffer(dst).unwrap(),
            &[0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3, 4]
        );
        assert!(device.fence_signaled(fence).unwrap());
        assert_eq!(device.submissions().len(), 1);
    }

    #[test]
    fn test_device_local_memory_is_not_writable() {
        let mut device = HeadlessDevice::default();
        let buffer = device
            .create_buffer(&RawBufferInfo {
                size: 4,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                location: MemoryLocation::GpuOnly,
                name: None,
            })
            .unwrap();
        assert!(device.write_buffer(buffer, 0, &[0]).is_err());
    }

    #[test]
    fn test_waiting_on_unsignaled_fence_fails() {
        let mut device = HeadlessDevice::default();
        let fence = device.create_fence(true).unwrap();
        assert!(device.wait_for_fence(fence, u64::MAX).is_ok());
        device.reset_fence(fence).unwrap();
        assert!(device.wait_for_fence(fence, 0).is_err());
    }

    #[test]
    fn test_descriptor_layout_ranges_are_disjoint() {
        let mut device = HeadlessDevice::default();
        let layout = device
            .descriptor_heap_layout(&DescriptorCapacities {
                sampled_images: 4,
                storage_images: 4,
                storage_buffers: 4,
                samplers: 2,
            })
            .unwrap();
        for pair in layout.ranges.windows(2) {
            assert!(pair[0].offset + pair[0].stride * pair[0].capacity as u64 <= pair[1].offset);
        }
        let last = layout.ranges[3];
        assert!(last.offset + last.stride * last.capacity as u64 <= layout.size);
    }

    #[test]
    fn test_timestamps_increase() {
        let mut device = HeadlessDevice::default();
        let pool = device.create_query_pool(QueryKind::Timestamp, 2).unwrap();
        let fence = device.create_fence(false).unwrap();
        let commands = vec![
            Command::WriteTimestamp { pool, query: 0 },
            Command::Dispatch { x: 1, y: 1, z: 1 },
            Command::WriteTimestamp { pool, query: 1 },
        ];
        device
            .submit(Submission {
                streams: vec![commands.as_slice()],
                wait: None,
                signal: None,
                fence,
            })
            .unwrap();
        let results = device.query_results(pool, 0, 2).unwrap();
        assert!(results[1] > results[0]);
    }
}
