//! Cross-stream reconciliation.
//!
//! Every resource carries the state the previous stream of the frame left it
//! in. Before a stream runs, each resource it touches is moved from that state
//! into the state the stream expects, with barriers appended to the stream
//! submitted right before it.

use ash::vk;

use super::barrier::{buffer_barrier, texture_barrier};
use super::{Command, CommandStream};
use crate::device::Device;
use crate::resource::TextureHandle;
use crate::usage::{
    texture_access, texture_layout, texture_stages, BufferState, TextureUsage, UsageState,
};
use crate::GpuContext;

/// Appends to `tail` the barriers `next` needs and advances the ground truth
/// of every resource `next` touched to the state `next` leaves it in.
///
/// Returns the number of barriers appended.
pub fn reconcile<D: Device>(
    ctx: &mut GpuContext<D>,
    tail: &mut CommandStream,
    next: &CommandStream,
) -> usize {
    let supported = ctx.device.capabilities().shader_stage_mask();
    let mut barriers = 0;
    for (handle, touch) in next.buffers.iter() {
        let buffer = ctx.resources.buffer_mut(handle);
        if buffer.state.conflicts(&touch.initial) {
            let barrier = buffer_barrier(buffer, buffer.state, touch.initial, supported);
            tail.record_barrier(Command::BufferBarrier(barrier));
            barriers += 1;
        }
        buffer.set_state(touch.last);
    }
    for (handle, touch) in next.textures.iter() {
        let texture = ctx.resources.texture_mut(handle);
        if texture.state.conflicts(&touch.initial) {
            let barrier = texture_barrier(texture, texture.state, touch.initial, supported);
            tail.record_barrier(Command::ImageBarrier(barrier));
            barriers += 1;
        }
        texture.set_state(touch.last);
    }
    barriers
}

/// Moves a swapchain image from its ground truth into the present layout.
///
/// Ownership is released to the present queue when it differs from the
/// graphics queue. Presenting leaves the contents undefined, so is the ground truth.
pub fn transition_for_present<D: Device>(
    ctx: &mut GpuContext<D>,
    stream: &mut CommandStream,
    texture: TextureHandle,
) {
    let capabilities = ctx.device.capabilities();
    let (src_queue_family, dst_queue_family) =
        if capabilities.graphics_queue_family != capabilities.present_queue_family {
            (
                capabilities.graphics_queue_family,
                capabilities.present_queue_family,
            )
        } else {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        };
    let supported = capabilities.shader_stage_mask();
    let image = ctx.resources.texture_mut(texture);
    let from = image.state;
    stream.record_barrier(Command::ImageBarrier(super::ImageBarrier {
        src_stage: texture_stages(from, supported),
        src_access: texture_access(from),
        dst_stage: vk::PipelineStageFlags2::NONE,
        dst_access: vk::AccessFlags2::NONE,
        old_layout: texture_layout(from),
        new_layout: texture_layout(TextureUsage::PRESENT),
        src_queue_family,
        dst_queue_family,
        ..texture_barrier(image, from, TextureUsage::PRESENT, supported)
    }));
    image.set_state(TextureUsage::empty());
}

/// Resets the ground truth of every resource `stream` touched to undefined.
///
/// For a reconciled stream whose submission failed: none of its transitions
/// happened, so the next use of each resource starts from scratch.
pub fn forget_states<D: Device>(ctx: &mut GpuContext<D>, stream: &CommandStream) {
    for buffer in stream.buffers.handles() {
        if let Some(buffer) = ctx.resources.try_buffer_mut(buffer) {
            buffer.set_state(BufferState::UNDEFINED);
        }
    }
    for texture in stream.textures.handles() {
        if let Some(texture) = ctx.resources.try_texture_mut(texture) {
            texture.set_state(TextureUsage::empty());
        }
    }
}
