pub mod table;

pub use table::DescriptorTable;

/// The four slot pools of the bindless table
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    SampledImage,
    StorageImage,
    StorageBuffer,
    Sampler,
}

impl DescriptorKind {
    pub const ALL: [DescriptorKind; 4] = [
        DescriptorKind::SampledImage,
        DescriptorKind::StorageImage,
        DescriptorKind::StorageBuffer,
        DescriptorKind::Sampler,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Slot count of every descriptor kind, fixed for the lifetime of the table
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DescriptorCapacities {
    pub sampled_images: u32,
    pub storage_images: u32,
    pub storage_buffers: u32,
    pub samplers: u32,
}

impl Default for DescriptorCapacities {
    fn default() -> Self {
        Self {
            sampled_images: 1024 * 1024,
            storage_images: 1024 * 1024,
            storage_buffers: 1024 * 1024,
            samplers: 16 * 1024,
        }
    }
}

impl DescriptorCapacities {
    pub fn capacity(&self, kind: DescriptorKind) -> u32 {
        match kind {
            DescriptorKind::SampledImage => self.sampled_images,
            DescriptorKind::StorageImage => self.storage_images,
            DescriptorKind::StorageBuffer => self.storage_buffers,
            DescriptorKind::Sampler => self.samplers,
        }
    }
}

/// Byte range of one descriptor kind inside the table
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DescriptorRange {
    pub offset: u64,
    pub stride: u64,
    pub capacity: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DescriptorHeapLayout {
    pub size: u64,
    /// Indexed by [`DescriptorKind::index`]
    pub ranges: [DescriptorRange; 4],
}

impl DescriptorHeapLayout {
    pub fn range(&self, kind: DescriptorKind) -> DescriptorRange {
        self.ranges[kind.index()]
    }
}
