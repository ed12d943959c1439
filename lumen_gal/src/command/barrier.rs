//! Derives synchronization2 barriers from pairs of tracked usages.

use ash::vk;

use super::{BufferBarrier, ImageBarrier};
use crate::resource::{Buffer, Texture};
use crate::usage::{
    buffer_access, buffer_stages, texture_access, texture_layout, texture_stages, BufferState,
    ShaderStages, TextureUsage,
};

/// Pipeline stages covered by a set of shader stages, limited to what the device supports
pub fn pipeline_stages(
    stages: ShaderStages,
    supported: vk::PipelineStageFlags2,
) -> vk::PipelineStageFlags2 {
    let mut flags = vk::PipelineStageFlags2::NONE;
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::PipelineStageFlags2::VERTEX_SHADER;
    }
    if stages.contains(ShaderStages::PIXEL) {
        flags |= vk::PipelineStageFlags2::FRAGMENT_SHADER;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::PipelineStageFlags2::COMPUTE_SHADER;
    }
    if stages.contains(ShaderStages::TASK) {
        flags |= vk::PipelineStageFlags2::TASK_SHADER_EXT;
    }
    if stages.contains(ShaderStages::MESH) {
        flags |= vk::PipelineStageFlags2::MESH_SHADER_EXT;
    }
    flags & supported
}

pub fn buffer_barrier(
    buffer: &Buffer,
    from: BufferState,
    to: BufferState,
    supported: vk::PipelineStageFlags2,
) -> BufferBarrier {
    BufferBarrier {
        buffer: buffer.handle(),
        src_stage: buffer_stages(from.usage, pipeline_stages(from.stages, supported)),
        src_access: buffer_access(from.usage),
        dst_stage: buffer_stages(to.usage, pipeline_stages(to.stages, supported)),
        dst_access: buffer_access(to.usage),
        offset: 0,
        size: vk::WHOLE_SIZE,
    }
}

/// Transition covering every mip and layer of `texture`
pub fn texture_barrier(
    texture: &Texture,
    from: TextureUsage,
    to: TextureUsage,
    supported: vk::PipelineStageFlags2,
) -> ImageBarrier {
    ImageBarrier {
        image: texture.image(),
        src_stage: texture_stages(from, supported),
        src_access: texture_access(from),
        dst_stage: texture_stages(to, supported),
        dst_access: texture_access(to),
        old_layout: texture_layout(from),
        new_layout: texture_layout(to),
        src_queue_family: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        aspect: texture.aspect(),
        base_mip: 0,
        mip_count: texture.mips(),
        base_layer: 0,
        layer_count: texture.layers(),
    }
}

/// Transition of a mip range only, used while walking a mip chain
pub fn mip_barrier(
    texture: &Texture,
    from: TextureUsage,
    to: TextureUsage,
    base_mip: u32,
    mip_count: u32,
) -> ImageBarrier {
    ImageBarrier {
        base_mip,
        mip_count,
        ..texture_barrier(texture, from, to, vk::PipelineStageFlags2::NONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::shader_stage_mask;

    #[test]
    fn test_stages_are_limited_to_supported() {
        let supported = shader_stage_mask(false);
        let stages = pipeline_stages(ShaderStages::ALL, supported);
        assert!(stages.contains(vk::PipelineStageFlags2::COMPUTE_SHADER));
        assert!(!stages.contains(vk::PipelineStageFlags2::MESH_SHADER_EXT));
        assert_eq!(
            pipeline_stages(ShaderStages::PIXEL, supported),
            vk::PipelineStageFlags2::FRAGMENT_SHADER
        );
    }
}
