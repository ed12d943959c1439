//! The device seam. Every GPU API call the core makes goes through [`Device`].

pub mod headless;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use headless::{HeadlessDevice, HeadlessDeviceConfiguration, HeadlessSubmission};
#[cfg(feature = "vulkan")]
pub use vulkan::{VulkanDevice, VulkanDeviceCreateInfo};

use anyhow::Result;
use ash::vk;

use crate::command::Command;
use crate::descriptor::{DescriptorCapacities, DescriptorHeapLayout, DescriptorKind};
use crate::pipelines::GraphicsPipelineDesc;
use crate::resource::SamplerState;
use crate::shader::ShaderBinary;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Memory useful in device accessible memory
    GpuOnly,
    /// Memory useful for uploading data to the device
    CpuToGpu,
    /// Memory useful for read back of data
    GpuToCpu,
}

impl MemoryLocation {
    pub fn is_host_visible(&self) -> bool {
        !matches!(self, MemoryLocation::GpuOnly)
    }
}

/// Per-kind descriptor sizes in bytes as reported by the driver
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DescriptorSizes {
    pub sampled_image: u64,
    pub storage_image: u64,
    pub storage_buffer: u64,
    pub sampler: u64,
}

impl DescriptorSizes {
    pub fn size(&self, kind: DescriptorKind) -> u64 {
        match kind {
            DescriptorKind::SampledImage => self.sampled_image,
            DescriptorKind::StorageImage => self.storage_image,
            DescriptorKind::StorageBuffer => self.storage_buffer,
            DescriptorKind::Sampler => self.sampler,
        }
    }
}

/// Optional device functionality, resolved once at device creation.
///
/// Call sites branch on these flags instead of probing for entry points.
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    pub debug_labels: bool,
    pub mesh_shading: bool,
    pub timestamps: bool,
    pub pipeline_statistics: bool,
    /// Nanoseconds per timestamp tick
    pub timestamp_period: f32,
    pub graphics_queue_family: u32,
    pub present_queue_family: u32,
    pub descriptor_sizes: DescriptorSizes,
}

impl Capabilities {
    pub fn shader_stage_mask(&self) -> vk::PipelineStageFlags2 {
        crate::usage::shader_stage_mask(self.mesh_shading)
    }
}

#[derive(Debug, Clone)]
pub struct RawBufferInfo<'a> {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub name: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct RawImageInfo<'a> {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub cube_compatible: bool,
    pub name: Option<&'a str>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ViewKind {
    D1,
    D1Array,
    D2,
    D2Array,
    Cube,
}

impl From<ViewKind> for vk::ImageViewType {
    fn from(value: ViewKind) -> Self {
        match value {
            ViewKind::D1 => vk::ImageViewType::TYPE_1D,
            ViewKind::D1Array => vk::ImageViewType::TYPE_1D_ARRAY,
            ViewKind::D2 => vk::ImageViewType::TYPE_2D,
            ViewKind::D2Array => vk::ImageViewType::TYPE_2D_ARRAY,
            ViewKind::Cube => vk::ImageViewType::CUBE,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct RawViewInfo {
    pub image: vk::Image,
    pub format: vk::Format,
    pub kind: ViewKind,
    pub aspect: vk::ImageAspectFlags,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

/// What a descriptor points at
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorInfo {
    SampledImage(vk::ImageView),
    StorageImage(vk::ImageView),
    StorageBuffer { buffer: vk::Buffer, range: u64 },
    Sampler(vk::Sampler),
}

impl DescriptorInfo {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            DescriptorInfo::SampledImage(_) => DescriptorKind::SampledImage,
            DescriptorInfo::StorageImage(_) => DescriptorKind::StorageImage,
            DescriptorInfo::StorageBuffer { .. } => DescriptorKind::StorageBuffer,
            DescriptorInfo::Sampler(_) => DescriptorKind::Sampler,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Timestamp,
    PipelineStatistics,
}

impl QueryKind {
    /// Number of `u64` values a single query resolves to
    pub fn values_per_query(&self) -> usize {
        match self {
            QueryKind::Timestamp => 1,
            QueryKind::PipelineStatistics => crate::query::PIPELINE_STATISTICS_COUNT,
        }
    }
}

/// A batch of encoded streams executed in order
#[derive(Debug)]
pub struct Submission<'a> {
    pub streams: Vec<&'a [Command]>,
    pub wait: Option<(vk::Semaphore, vk::PipelineStageFlags2)>,
    pub signal: Option<vk::Semaphore>,
    pub fence: vk::Fence,
}

/// GPU device backend.
///
/// Handles returned by the `create_*` functions are owned by the caller and
/// must be handed back to the matching `destroy_*` call.
pub trait Device {
    fn capabilities(&self) -> &Capabilities;

    fn create_buffer(&mut self, info: &RawBufferInfo) -> Result<vk::Buffer>;

    fn destroy_buffer(&mut self, buffer: vk::Buffer);

    /// Writes into host visible memory
    fn write_buffer(&mut self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    fn create_image(&mut self, info: &RawImageInfo) -> Result<vk::Image>;

    fn destroy_image(&mut self, image: vk::Image);

    fn create_image_view(&mut self, info: &RawViewInfo) -> Result<vk::ImageView>;

    fn destroy_image_view(&mut self, view: vk::ImageView);

    fn create_sampler(&mut self, state: &SamplerState) -> Result<vk::Sampler>;

    fn destroy_sampler(&mut self, sampler: vk::Sampler);

    /// Sets up the bindless set layout and the shared pipeline layout, and
    /// reports where each descriptor kind lives inside the table
    fn descriptor_heap_layout(
        &mut self,
        capacities: &DescriptorCapacities,
    ) -> Result<DescriptorHeapLayout>;

    /// Raw descriptor bytes to be written into the table
    fn descriptor_bytes(&mut self, info: &DescriptorInfo) -> Result<Vec<u8>>;

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc,
        stages: &[ShaderBinary],
    ) -> Result<vk::Pipeline>;

    fn create_compute_pipeline(&mut self, stage: &ShaderBinary) -> Result<vk::Pipeline>;

    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline);

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence>;

    fn destroy_fence(&mut self, fence: vk::Fence);

    fn wait_for_fence(&mut self, fence: vk::Fence, timeout: u64) -> Result<()>;

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()>;

    fn fence_signaled(&mut self, fence: vk::Fence) -> Result<bool>;

    fn create_semaphore(&mut self) -> Result<vk::Semaphore>;

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore);

    fn create_query_pool(&mut self, kind: QueryKind, count: u32) -> Result<vk::QueryPool>;

    fn destroy_query_pool(&mut self, pool: vk::QueryPool);

    /// Host side reset of a query range
    fn reset_query_pool(&mut self, pool: vk::QueryPool, first: u32, count: u32);

    /// Waits for and returns `count * values_per_query` results
    fn query_results(&mut self, pool: vk::QueryPool, first: u32, count: u32) -> Result<Vec<u64>>;

    fn submit(&mut self, submission: Submission<'_>) -> Result<()>;

    fn wait_idle(&mut self) -> Result<()>;
}
