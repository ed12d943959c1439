//! Semantic resource usages and their translation into synchronization2 terms.
//!
//! A usage says *how* a resource is about to be accessed. Barriers are derived
//! from pairs of usages, never written by hand.

use ash::vk;
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const STORAGE_READ = 1 << 3;
        const STORAGE_WRITE = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct TextureUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLE = 1 << 2;
        const COLOR_TARGET = 1 << 3;
        const DEPTH_TARGET = 1 << 4;
        const STORAGE = 1 << 5;
        const PRESENT = 1 << 6;
    }
}

bitflags! {
    #[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const PIXEL = 1 << 4;
        const COMPUTE = 1 << 5;
        const TASK = 1 << 6;
        const MESH = 1 << 7;
        const ALL = Self::VERTEX.bits()
            | Self::PIXEL.bits()
            | Self::COMPUTE.bits()
            | Self::TASK.bits()
            | Self::MESH.bits();
    }
}

impl BufferUsage {
    pub const WRITES: Self = Self::TRANSFER_DST.union(Self::STORAGE_WRITE);
}

impl TextureUsage {
    pub const WRITES: Self = Self::TRANSFER_DST
        .union(Self::COLOR_TARGET)
        .union(Self::DEPTH_TARGET)
        .union(Self::STORAGE);
}

/// Common behaviour of tracked resource states
pub trait UsageState: Copy + Eq + std::fmt::Debug + Default {
    fn is_undefined(&self) -> bool;

    fn has_writes(&self) -> bool;

    /// Whether a resource in state `self` can be accessed as `next` without
    /// any memory or layout dependency
    fn covers(&self, next: &Self) -> bool;

    /// True when moving from `self` to `next` needs a barrier
    fn conflicts(&self, next: &Self) -> bool {
        self.is_undefined()
            || next.is_undefined()
            || self.has_writes()
            || next.has_writes()
            || !self.covers(next)
    }
}

/// Tracked state of a buffer: what it is used for and by which shader stages
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
pub struct BufferState {
    pub usage: BufferUsage,
    pub stages: ShaderStages,
}

impl BufferState {
    pub const UNDEFINED: Self = Self {
        usage: BufferUsage::empty(),
        stages: ShaderStages::empty(),
    };

    pub fn new(usage: BufferUsage, stages: ShaderStages) -> Self {
        Self { usage, stages }
    }

    pub fn transfer(usage: BufferUsage) -> Self {
        Self {
            usage,
            stages: ShaderStages::empty(),
        }
    }
}

impl UsageState for BufferState {
    fn is_undefined(&self) -> bool {
        self.usage.is_empty() && self.stages.is_empty()
    }

    fn has_writes(&self) -> bool {
        self.usage.intersects(BufferUsage::WRITES)
    }

    fn covers(&self, next: &Self) -> bool {
        self.usage.contains(next.usage) && self.stages.contains(next.stages)
    }
}

impl UsageState for TextureUsage {
    fn is_undefined(&self) -> bool {
        self.is_empty()
    }

    fn has_writes(&self) -> bool {
        self.intersects(TextureUsage::WRITES)
    }

    // differing read usages imply differing layouts
    fn covers(&self, next: &Self) -> bool {
        self == next
    }
}

/// Every pipeline stage that can run shader code on this device
pub fn shader_stage_mask(mesh_shading: bool) -> vk::PipelineStageFlags2 {
    let mut mask = vk::PipelineStageFlags2::VERTEX_SHADER
        | vk::PipelineStageFlags2::FRAGMENT_SHADER
        | vk::PipelineStageFlags2::COMPUTE_SHADER;
    if mesh_shading {
        mask |= vk::PipelineStageFlags2::TASK_SHADER_EXT | vk::PipelineStageFlags2::MESH_SHADER_EXT;
    }
    mask
}

pub fn buffer_stages(
    usage: BufferUsage,
    shader_stages: vk::PipelineStageFlags2,
) -> vk::PipelineStageFlags2 {
    let mut stages = vk::PipelineStageFlags2::NONE;
    if usage.intersects(BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST) {
        stages |= vk::PipelineStageFlags2::COPY;
    }
    if usage.intersects(BufferUsage::STORAGE_READ | BufferUsage::STORAGE_WRITE) {
        stages |= shader_stages;
    }
    stages
}

pub fn buffer_access(usage: BufferUsage) -> vk::AccessFlags2 {
    let mut access = vk::AccessFlags2::NONE;
    if usage.contains(BufferUsage::TRANSFER_SRC) {
        access |= vk::AccessFlags2::TRANSFER_READ;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        access |= vk::AccessFlags2::TRANSFER_WRITE;
    }
    if usage.contains(BufferUsage::STORAGE_READ) {
        access |= vk::AccessFlags2::SHADER_STORAGE_READ;
    }
    if usage.contains(BufferUsage::STORAGE_WRITE) {
        access |= vk::AccessFlags2::SHADER_STORAGE_WRITE;
    }
    access
}

pub fn texture_stages(
    usage: TextureUsage,
    shader_stages: vk::PipelineStageFlags2,
) -> vk::PipelineStageFlags2 {
    let mut stages = vk::PipelineStageFlags2::NONE;
    if usage.intersects(TextureUsage::TRANSFER_SRC | TextureUsage::TRANSFER_DST) {
        stages |= vk::PipelineStageFlags2::TRANSFER;
    }
    if usage.intersects(TextureUsage::SAMPLE | TextureUsage::STORAGE) {
        stages |= shader_stages;
    }
    if usage.contains(TextureUsage::COLOR_TARGET) {
        stages |= vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags2::RESOLVE;
    }
    if usage.contains(TextureUsage::DEPTH_TARGET) {
        stages |= vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS
            | vk::PipelineStageFlags2::RESOLVE;
    }
    stages
}

pub fn texture_access(usage: TextureUsage) -> vk::AccessFlags2 {
    let mut access = vk::AccessFlags2::NONE;
    if usage.contains(TextureUsage::TRANSFER_SRC) {
        access |= vk::AccessFlags2::TRANSFER_READ;
    }
    if usage.contains(TextureUsage::TRANSFER_DST) {
        access |= vk::AccessFlags2::TRANSFER_WRITE;
    }
    if usage.contains(TextureUsage::SAMPLE) {
        access |= vk::AccessFlags2::SHADER_READ;
    }
    if usage.contains(TextureUsage::COLOR_TARGET) {
        access |= vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE;
    }
    if usage.contains(TextureUsage::DEPTH_TARGET) {
        access |= vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }
    if usage.contains(TextureUsage::STORAGE) {
        access |= vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE;
    }
    access
}

/// Image layout for a single-bit usage.
///
/// # Panics
/// If more than one usage bit is set; a texture can only be in one layout.
pub fn texture_layout(usage: TextureUsage) -> vk::ImageLayout {
    assert!(
        usage.bits().count_ones() <= 1,
        "Texture layout is only defined for a single usage, got {usage:?}"
    );
    if usage == TextureUsage::TRANSFER_SRC {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL
    } else if usage == TextureUsage::TRANSFER_DST {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL
    } else if usage == TextureUsage::SAMPLE {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    } else if usage == TextureUsage::COLOR_TARGET {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    } else if usage == TextureUsage::DEPTH_TARGET {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else if usage == TextureUsage::STORAGE {
        vk::ImageLayout::GENERAL
    } else if usage == TextureUsage::PRESENT {
        vk::ImageLayout::PRESENT_SRC_KHR
    } else {
        vk::ImageLayout::UNDEFINED
    }
}

impl From<BufferUsage> for vk::BufferUsageFlags {
    fn from(value: BufferUsage) -> Self {
        let mut flags = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        if value.contains(BufferUsage::TRANSFER_SRC) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if value.contains(BufferUsage::TRANSFER_DST) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if value.intersects(BufferUsage::STORAGE_READ | BufferUsage::STORAGE_WRITE) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        flags
    }
}

impl From<TextureUsage> for vk::ImageUsageFlags {
    fn from(value: TextureUsage) -> Self {
        let mut flags = vk::ImageUsageFlags::empty();
        if value.contains(TextureUsage::TRANSFER_SRC) {
            flags |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if value.contains(TextureUsage::TRANSFER_DST) {
            flags |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        if value.contains(TextureUsage::SAMPLE) {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if value.contains(TextureUsage::COLOR_TARGET) {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if value.contains(TextureUsage::DEPTH_TARGET) {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if value.contains(TextureUsage::STORAGE) {
            flags |= vk::ImageUsageFlags::STORAGE;
        }
        flags
    }
}
