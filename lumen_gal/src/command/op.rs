use ash::vk;

/// Whole-range or partial buffer memory dependency
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub aspect: vk::ImageAspectFlags,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum AttachmentClear {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AttachmentInfo {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: Option<AttachmentClear>,
}

#[derive(Debug, Clone)]
pub struct RenderingInfo {
    pub area: vk::Rect2D,
    pub layer_count: u32,
    pub color: Vec<AttachmentInfo>,
    pub depth: Option<AttachmentInfo>,
}

#[derive(Debug, Copy, Clone)]
pub struct BlitInfo {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub src_mip: u32,
    pub src_extent: vk::Extent3D,
    pub dst_mip: u32,
    pub dst_extent: vk::Extent3D,
    pub layer_count: u32,
}

/// One recorded GPU operation.
///
/// Streams are kept as plain command lists and encoded by the [`crate::device::Device`]
/// at submission, which lets barriers be appended after recording has finished.
#[derive(Debug, Clone)]
pub enum Command {
    BufferBarrier(BufferBarrier),
    ImageBarrier(ImageBarrier),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    },
    BlitImage(BlitInfo),
    FillBuffer {
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    },
    BeginRendering(RenderingInfo),
    EndRendering,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorTable {
        buffer: vk::Buffer,
    },
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    PushConstants(Vec<u8>),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawMeshTasks {
        x: u32,
        y: u32,
        z: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    BeginLabel(String),
    EndLabel,
    WriteTimestamp {
        pool: vk::QueryPool,
        query: u32,
    },
    BeginQuery {
        pool: vk::QueryPool,
        query: u32,
    },
    EndQuery {
        pool: vk::QueryPool,
        query: u32,
    },
}

impl Command {
    pub fn is_barrier(&self) -> bool {
        matches!(self, Command::BufferBarrier(_) | Command::ImageBarrier(_))
    }
}
