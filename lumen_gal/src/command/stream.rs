use std::collections::HashMap;
use std::hash::Hash;

use anyhow::Result;
use ash::vk;
use bytemuck::Pod;
use tracing::error;

use super::barrier;
use super::render_pass::PassState;
use super::Command;
use crate::device::{Device, QueryKind};
use crate::pipelines::{ComputePipelineId, GraphicsPipelineId};
use crate::resource::{BufferHandle, TextureHandle};
use crate::usage::{BufferState, BufferUsage, ShaderStages, TextureUsage, UsageState};
use crate::{GalError, GpuContext};

pub const MAX_PUSH_CONSTANT_SIZE: usize = 64;

/// Lifecycle of a [`CommandStream`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StreamState {
    Initial,
    Recording,
    Executable,
    Pending,
}

/// Usage a resource must be in when the stream starts, and the usage it is left in
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Touch<S> {
    pub initial: S,
    pub last: S,
}

pub(crate) enum TouchOutcome<S> {
    First,
    Covered,
    Transition(S),
}

/// Insertion ordered set of the resources a stream touched
#[derive(Debug)]
pub(crate) struct TouchSet<H, S> {
    entries: Vec<(H, Touch<S>)>,
    index: HashMap<H, usize>,
}

impl<H, S> Default for TouchSet<H, S> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<H: Copy + Eq + Hash, S: UsageState> TouchSet<H, S> {
    pub(crate) fn touch(&mut self, handle: H, requested: S) -> TouchOutcome<S> {
        match self.index.get(&handle) {
            None => {
                self.index.insert(handle, self.entries.len());
                self.entries.push((
                    handle,
                    Touch {
                        initial: requested,
                        last: requested,
                    },
                ));
                TouchOutcome::First
            }
            Some(&index) => {
                let touch = &mut self.entries[index].1;
                if touch.last.conflicts(&requested) {
                    let previous = touch.last;
                    touch.last = requested;
                    TouchOutcome::Transition(previous)
                } else {
                    // `last` stays the broader state so a later barrier waits on every earlier reader
                    TouchOutcome::Covered
                }
            }
        }
    }

    pub(crate) fn get(&self, handle: H) -> Option<Touch<S>> {
        self.index.get(&handle).map(|index| self.entries[*index].1)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (H, Touch<S>)> + '_ {
        self.entries.iter().copied()
    }

    pub(crate) fn handles(&self) -> impl Iterator<Item = H> + '_ {
        self.entries.iter().map(|(handle, _)| *handle)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

/// Pipeline and dynamic state bound in the stream
#[derive(Debug, Default, Clone)]
pub(crate) struct BoundState {
    pub graphics: Option<GraphicsPipelineId>,
    pub compute: Option<ComputePipelineId>,
    /// Last pipeline object actually recorded
    pub bound: Option<vk::Pipeline>,
    pub viewport: Option<vk::Viewport>,
    pub scissor: Option<vk::Rect2D>,
    pub viewport_dirty: bool,
    pub scissor_dirty: bool,
}

/// A timestamp written by a zone. Begins carry the zone name, ends carry none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampMark {
    pub name: Option<String>,
    pub query: u32,
}

/// Append-only list of GPU operations plus the usages of every resource it touches.
///
/// Usages are requested through `register_*`. A conflicting transition inside
/// the stream gets its barrier right away, so the first usage of a resource is
/// fixed and only the last one moves.
#[derive(Debug)]
pub struct CommandStream {
    name: Option<String>,
    state: StreamState,
    commands: Vec<Command>,
    pub(crate) buffers: TouchSet<BufferHandle, BufferState>,
    pub(crate) textures: TouchSet<TextureHandle, TextureUsage>,
    staging: Vec<vk::Buffer>,
    pub(super) bindings: BoundState,
    pub(super) pass: PassState,
    timestamps: Vec<TimestampMark>,
    zones: Vec<bool>,
    statistics: Option<vk::QueryPool>,
    statistics_recorded: bool,
    label_open: bool,
}

impl CommandStream {
    pub fn new(name: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_string),
            state: StreamState::Initial,
            commands: Vec::new(),
            buffers: TouchSet::default(),
            textures: TouchSet::default(),
            staging: Vec::new(),
            bindings: BoundState::default(),
            pass: PassState::default(),
            timestamps: Vec::new(),
            zones: Vec::new(),
            statistics: None,
            statistics_recorded: false,
            label_open: false,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Takes effect at the next [`CommandStream::begin`]
    pub fn set_name(&mut self, name: Option<&str>) {
        self.name = name.map(str::to_string);
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn buffer_touch(&self, buffer: BufferHandle) -> Option<Touch<BufferState>> {
        self.buffers.get(buffer)
    }

    pub fn texture_touch(&self, texture: TextureHandle) -> Option<Touch<TextureUsage>> {
        self.textures.get(texture)
    }

    pub fn touched_resources(&self) -> usize {
        self.buffers.len() + self.textures.len()
    }

    pub fn timestamps(&self) -> &[TimestampMark] {
        &self.timestamps
    }

    /// Query pool holding this recording's pipeline statistics, if any were recorded
    pub fn statistics_query(&self) -> Option<vk::QueryPool> {
        self.statistics.filter(|_| self.statistics_recorded)
    }

    fn expect_state(&self, expected: StreamState) -> Result<()> {
        if self.state != expected {
            return Err(GalError::InvalidStreamState {
                expected,
                found: self.state,
            }
            .into());
        }
        Ok(())
    }

    pub fn begin<D: Device>(&mut self, ctx: &mut GpuContext<D>) -> Result<()> {
        self.expect_state(StreamState::Initial)?;
        let statistics = if ctx.config.pipeline_statistics
            && ctx.device.capabilities().pipeline_statistics
        {
            let pool = match self.statistics {
                Some(pool) => pool,
                None => {
                    let pool = ctx
                        .device
                        .create_query_pool(QueryKind::PipelineStatistics, 1)?;
                    self.statistics = Some(pool);
                    pool
                }
            };
            ctx.device.reset_query_pool(pool, 0, 1);
            Some(pool)
        } else {
            None
        };

        self.state = StreamState::Recording;
        self.record(Command::BindDescriptorTable {
            buffer: ctx.descriptors.buffer(),
        });
        if let Some(pool) = statistics {
            self.record(Command::BeginQuery { pool, query: 0 });
            self.statistics_recorded = true;
        }
        if ctx.device.capabilities().debug_labels {
            if let Some(name) = self.name.clone() {
                self.record(Command::BeginLabel(name));
                self.label_open = true;
            }
        }
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        self.expect_state(StreamState::Recording)?;
        self.try_end_rendering();
        if self.label_open {
            self.record(Command::EndLabel);
            self.label_open = false;
        }
        if self.statistics_recorded {
            if let Some(pool) = self.statistics {
                self.record(Command::EndQuery { pool, query: 0 });
            }
        }
        self.state = StreamState::Executable;
        Ok(())
    }

    /// Moves every touched resource from recording to pending
    pub fn mark_submitted<D: Device>(&mut self, ctx: &mut GpuContext<D>) {
        assert_eq!(
            self.state,
            StreamState::Executable,
            "Only ended command streams can be submitted"
        );
        for buffer in self.buffers.handles() {
            ctx.resources.buffer_mut(buffer).residency.submit();
        }
        for texture in self.textures.handles() {
            ctx.resources.texture_mut(texture).residency.submit();
        }
        self.state = StreamState::Pending;
    }

    /// Returns the stream to [`StreamState::Initial`].
    ///
    /// A pending stream must only be reset once its submission has retired.
    pub fn reset<D: Device>(&mut self, ctx: &mut GpuContext<D>) {
        let submitted = self.state == StreamState::Pending;
        for buffer in self.buffers.handles() {
            if let Some(buffer) = ctx.resources.try_buffer_mut(buffer) {
                buffer.residency.release(submitted);
            }
        }
        for texture in self.textures.handles() {
            if let Some(texture) = ctx.resources.try_texture_mut(texture) {
                texture.residency.release(submitted);
            }
        }
        for staging in self.staging.drain(..) {
            ctx.device.destroy_buffer(staging);
        }
        self.commands.clear();
        self.buffers.clear();
        self.textures.clear();
        self.bindings = BoundState::default();
        self.pass = PassState::default();
        self.timestamps.clear();
        self.zones.clear();
        self.statistics_recorded = false;
        self.label_open = false;
        self.state = StreamState::Initial;
    }

    pub fn destroy<D: Device>(&mut self, ctx: &mut GpuContext<D>) {
        self.reset(ctx);
        if let Some(pool) = self.statistics.take() {
            ctx.device.destroy_query_pool(pool);
        }
    }

    pub(crate) fn assert_recording(&self) {
        assert_eq!(
            self.state,
            StreamState::Recording,
            "Command stream {:?} is not recording",
            self.name
        );
    }

    pub(crate) fn record(&mut self, command: Command) {
        self.assert_recording();
        self.commands.push(command);
    }

    /// # Panics
    /// Inside an open render pass, since a pass cannot be reopened
    pub(crate) fn record_barrier(&mut self, command: Command) {
        assert!(
            !self.pass.active,
            "Barrier recorded inside an open render pass of stream {:?}",
            self.name
        );
        self.record(command);
    }

    /// Keeps a scratch buffer alive until the stream is reset
    pub(crate) fn keep_staging(&mut self, buffer: vk::Buffer) {
        self.staging.push(buffer);
    }

    pub(crate) fn use_buffer<D: Device>(
        &mut self,
        ctx: &mut GpuContext<D>,
        handle: BufferHandle,
        requested: BufferState,
    ) {
        self.assert_recording();
        let buffer = ctx.resources.buffer(handle);
        assert!(
            buffer.usage().contains(requested.usage),
            "Buffer {:?} used as {:?} outside its declared usage {:?}",
            buffer.name(),
            requested.usage,
            buffer.usage()
        );
        match self.buffers.touch(handle, requested) {
            TouchOutcome::First => ctx.resources.buffer_mut(handle).residency.recording += 1,
            TouchOutcome::Covered => {}
            TouchOutcome::Transition(previous) => {
                let supported = ctx.device.capabilities().shader_stage_mask();
                let barrier =
                    barrier::buffer_barrier(ctx.resources.buffer(handle), previous, requested, supported);
                self.record_barrier(Command::BufferBarrier(barrier));
            }
        }
    }

    pub(crate) fn use_texture<D: Device>(
        &mut self,
        ctx: &mut GpuContext<D>,
        handle: TextureHandle,
        requested: TextureUsage,
    ) {
        self.assert_recording();
        let texture = ctx.resources.texture(handle);
        assert!(
            texture.usage().contains(requested),
            "Texture {:?} used as {:?} outside its declared usage {:?}",
            texture.name(),
            requested,
            texture.usage()
        );
        match self.textures.touch(handle, requested) {
            TouchOutcome::First => ctx.resources.texture_mut(handle).residency.recording += 1,
            TouchOutcome::Covered => {}
            TouchOutcome::Transition(previous) => {
                let supported = ctx.device.capabilities().shader_stage_mask();
                let barrier = barrier::texture_barrier(
                    ctx.resources.texture(handle),
                    previous,
                    requested,
                    supported,
                );
                self.record_barrier(Command::ImageBarrier(barrier));
            }
        }
    }

    pub fn register_srv_buffer<D: Device>(&mut self, ctx: &mut GpuContext<D>, buffer: BufferHandle) {
        self.use_buffer(
            ctx,
            buffer,
            BufferState::new(BufferUsage::STORAGE_READ, ShaderStages::ALL),
        );
    }

    pub fn register_uav_buffer<D: Device>(&mut self, ctx: &mut GpuContext<D>, buffer: BufferHandle) {
        self.use_buffer(
            ctx,
            buffer,
            BufferState::new(
                BufferUsage::STORAGE_READ | BufferUsage::STORAGE_WRITE,
                ShaderStages::ALL,
            ),
        );
    }

    pub fn register_srv_texture<D: Device>(&mut self, ctx: &mut GpuContext<D>, texture: TextureHandle) {
        self.use_texture(ctx, texture, TextureUsage::SAMPLE);
    }

    pub fn register_uav_texture<D: Device>(&mut self, ctx: &mut GpuContext<D>, texture: TextureHandle) {
        self.use_texture(ctx, texture, TextureUsage::STORAGE);
    }

    pub fn set_graphics_pipeline(&mut self, pipeline: GraphicsPipelineId) {
        self.assert_recording();
        self.bindings.graphics = Some(pipeline);
        self.bindings.compute = None;
    }

    pub fn set_compute_pipeline(&mut self, pipeline: ComputePipelineId) {
        self.assert_recording();
        self.bindings.compute = Some(pipeline);
        self.bindings.graphics = None;
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.assert_recording();
        self.bindings.viewport = Some(viewport);
        self.bindings.viewport_dirty = true;
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        self.assert_recording();
        self.bindings.scissor = Some(scissor);
        self.bindings.scissor_dirty = true;
    }

    pub fn push_constants<T: Pod>(&mut self, value: &T) {
        let bytes = bytemuck::bytes_of(value);
        assert!(
            bytes.len() <= MAX_PUSH_CONSTANT_SIZE,
            "Push constants of {} bytes exceed the {MAX_PUSH_CONSTANT_SIZE} byte limit",
            bytes.len()
        );
        self.record(Command::PushConstants(bytes.to_vec()));
    }

    /// Forgets bound pipelines and dynamic state, forcing a rebind on the next draw
    pub fn reset_bind_and_render_states(&mut self) {
        self.bindings = BoundState::default();
    }

    fn bind(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        if self.bindings.bound != Some(pipeline) {
            self.record(Command::BindPipeline {
                bind_point,
                pipeline,
            });
            self.bindings.bound = Some(pipeline);
        }
    }

    fn resolve_graphics<D: Device>(&self, ctx: &GpuContext<D>) -> Option<vk::Pipeline> {
        let Some(id) = self.bindings.graphics else {
            error!(stream = ?self.name, "Draw without a bound graphics pipeline");
            return None;
        };
        let Some(pipeline) = ctx.graphics_pipelines.raw(id) else {
            error!(stream = ?self.name, ?id, "Graphics pipeline has no compiled object");
            return None;
        };
        Some(pipeline)
    }

    fn flush_dynamic_state(&mut self) {
        let area = self.pass.area;
        if self.bindings.viewport_dirty {
            let viewport = self.bindings.viewport.unwrap_or(vk::Viewport {
                x: area.offset.x as f32,
                y: area.offset.y as f32,
                width: area.extent.width as f32,
                height: area.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            });
            self.record(Command::SetViewport(viewport));
            self.bindings.viewport_dirty = false;
        }
        if self.bindings.scissor_dirty {
            let scissor = self.bindings.scissor.unwrap_or(area);
            self.record(Command::SetScissor(scissor));
            self.bindings.scissor_dirty = false;
        }
    }

    /// Begins the pass if render targets are bound and readies pipeline and dynamic state.
    /// Without a usable pipeline nothing is recorded, not even the pass.
    fn prepare_draw<D: Device>(&mut self, ctx: &mut GpuContext<D>) -> bool {
        self.assert_recording();
        let Some(pipeline) = self.resolve_graphics(ctx) else {
            return false;
        };
        if !self.pass.active && self.pass.has_attachments() {
            self.begin_render_pass(ctx);
        }
        assert!(
            self.pass.active,
            "Draw recorded outside a render pass in stream {:?}",
            self.name
        );
        self.bind(vk::PipelineBindPoint::GRAPHICS, pipeline);
        self.flush_dynamic_state();
        true
    }

    pub fn draw<D: Device>(
        &mut self,
        ctx: &mut GpuContext<D>,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        if self.prepare_draw(ctx) {
            self.record(Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            });
        }
    }

    pub fn draw_mesh_tasks<D: Device>(&mut self, ctx: &mut GpuContext<D>, x: u32, y: u32, z: u32) {
        if !ctx.device.capabilities().mesh_shading {
            error!(stream = ?self.name, "Mesh shading is not supported by this device");
            return;
        }
        if self.prepare_draw(ctx) {
            self.record(Command::DrawMeshTasks { x, y, z });
        }
    }

    pub fn dispatch<D: Device>(&mut self, ctx: &mut GpuContext<D>, x: u32, y: u32, z: u32) {
        self.assert_recording();
        assert!(
            !self.pass.active,
            "Dispatch recorded inside an open render pass in stream {:?}",
            self.name
        );
        let Some(id) = self.bindings.compute else {
            error!(stream = ?self.name, "Dispatch without a bound compute pipeline");
            return;
        };
        let Some(pipeline) = ctx.compute_pipelines.raw(id) else {
            error!(stream = ?self.name, ?id, "Compute pipeline has no compiled object");
            return;
        };
        self.bind(vk::PipelineBindPoint::COMPUTE, pipeline);
        self.record(Command::Dispatch { x, y, z });
    }

    pub fn marker_begin<D: Device>(&mut self, ctx: &GpuContext<D>, name: &str) {
        if ctx.device.capabilities().debug_labels {
            self.record(Command::BeginLabel(name.to_string()));
        }
    }

    pub fn marker_end<D: Device>(&mut self, ctx: &GpuContext<D>) {
        if ctx.device.capabilities().debug_labels {
            self.record(Command::EndLabel);
        }
    }

    /// Opens a GPU timing zone. Silently skipped when profiling is off or the
    /// frame ran out of timestamp queries.
    pub fn begin_zone<D: Device>(&mut self, ctx: &mut GpuContext<D>, name: &str) {
        self.assert_recording();
        let recorded = match ctx.timestamps.allocate() {
            Some((pool, query)) => {
                self.record(Command::WriteTimestamp { pool, query });
                self.timestamps.push(TimestampMark {
                    name: Some(name.to_string()),
                    query,
                });
                true
            }
            None => false,
        };
        self.zones.push(recorded);
    }

    pub fn end_zone<D: Device>(&mut self, ctx: &mut GpuContext<D>) {
        self.assert_recording();
        match self.zones.pop() {
            None => error!(stream = ?self.name, "end_zone without a matching begin_zone"),
            Some(false) => {}
            Some(true) => {
                if let Some((pool, query)) = ctx.timestamps.allocate() {
                    self.record(Command::WriteTimestamp { pool, query });
                    self.timestamps.push(TimestampMark { name: None, query });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{headless_context, submit};
    use crate::resource::{BufferCreateInfo, TextureCreateInfo};

    fn barriers(stream: &CommandStream) -> usize {
        stream.commands().iter().filter(|command| command.is_barrier()).count()
    }

    #[test]
    fn test_begin_twice_is_an_error() {
        let mut ctx = headless_context();
        let mut stream = CommandStream::new(Some("Twice"));
        stream.begin(&mut ctx).unwrap();
        let err = stream.begin(&mut ctx).unwrap_err();
        assert_eq!(
            err.downcast_ref::<GalError>(),
            Some(&GalError::InvalidStreamState {
                expected: StreamState::Initial,
                found: StreamState::Recording,
            })
        );
        stream.destroy(&mut ctx);
    }

    #[test]
    fn test_begin_binds_table_and_opens_label() {
        let mut ctx = headless_context();
        let mut stream = CommandStream::new(Some("Labelled"));
        stream.begin(&mut ctx).unwrap();
        assert!(matches!(
            stream.commands()[0],
            Command::BindDescriptorTable { .. }
        ));
        assert!(stream
            .commands()
            .iter()
            .any(|command| matches!(command, Command::BeginLabel(name) if name == "Labelled")));
        stream.end().unwrap();
        assert!(matches!(stream.commands().last(), Some(Command::EndQuery { .. })));
        stream.destroy(&mut ctx);
    }

    #[test]
    #[should_panic(expected = "not recording")]
    fn test_recording_after_end_panics() {
        let mut ctx = headless_context();
        let buffer = ctx
            .create_buffer(BufferCreateInfo::structured(64, false))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.end().unwrap();
        stream.register_srv_buffer(&mut ctx, buffer);
    }

    #[test]
    fn test_first_touch_fixes_initial_usage() {
        let mut ctx = headless_context();
        let buffer = ctx
            .create_buffer(BufferCreateInfo::structured(64, true))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.register_uav_buffer(&mut ctx, buffer);
        stream.register_srv_buffer(&mut ctx, buffer);

        let touch = stream.buffer_touch(buffer).unwrap();
        assert!(touch.initial.usage.contains(BufferUsage::STORAGE_WRITE));
        assert_eq!(touch.last.usage, BufferUsage::STORAGE_READ);
        assert_eq!(barriers(&stream), 1);
        stream.destroy(&mut ctx);
    }

    #[test]
    fn test_repeated_reads_record_no_barrier() {
        let mut ctx = headless_context();
        let texture = ctx
            .create_texture(TextureCreateInfo::texture_2d(
                TextureUsage::SAMPLE,
                vk::Format::R8G8B8A8_UNORM,
                16,
                16,
                1,
                false,
            ))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.register_srv_texture(&mut ctx, texture);
        stream.register_srv_texture(&mut ctx, texture);
        assert_eq!(barriers(&stream), 0);
        stream.destroy(&mut ctx);
    }

    #[test]
    fn test_narrower_read_keeps_broader_last_usage() {
        let mut ctx = headless_context();
        let buffer = ctx
            .create_buffer(BufferCreateInfo::structured(64, false))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.register_srv_buffer(&mut ctx, buffer);
        stream.use_buffer(
            &mut ctx,
            buffer,
            BufferState::new(BufferUsage::STORAGE_READ, ShaderStages::COMPUTE),
        );
        assert_eq!(barriers(&stream), 0);
        assert_eq!(stream.buffer_touch(buffer).unwrap().last.stages, ShaderStages::ALL);
        stream.destroy(&mut ctx);
    }

    #[test]
    fn test_differing_texture_reads_change_layout() {
        let mut ctx = headless_context();
        let texture = ctx
            .create_texture(TextureCreateInfo::texture_2d(
                TextureUsage::SAMPLE | TextureUsage::TRANSFER_SRC,
                vk::Format::R8G8B8A8_UNORM,
                16,
                16,
                1,
                false,
            ))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.register_srv_texture(&mut ctx, texture);
        stream.use_texture(&mut ctx, texture, TextureUsage::TRANSFER_SRC);
        assert_eq!(barriers(&stream), 1);
        assert_eq!(
            stream.texture_touch(texture).unwrap().last,
            TextureUsage::TRANSFER_SRC
        );
        stream.destroy(&mut ctx);
    }

    #[test]
    #[should_panic(expected = "is not recording")]
    fn test_dynamic_state_after_end_panics() {
        let mut ctx = headless_context();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.end().unwrap();
        stream.set_scissor(vk::Rect2D::default());
    }

    #[test]
    fn test_repeated_writes_are_serialized() {
        let mut ctx = headless_context();
        let texture = ctx
            .create_texture(TextureCreateInfo::texture_2d(
                TextureUsage::STORAGE,
                vk::Format::R8G8B8A8_UNORM,
                16,
                16,
                1,
                false,
            ))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.register_uav_texture(&mut ctx, texture);
        stream.register_uav_texture(&mut ctx, texture);
        assert_eq!(barriers(&stream), 1);
        let Some(Command::ImageBarrier(barrier)) =
            stream.commands().iter().find(|command| command.is_barrier())
        else {
            panic!("expected an image barrier");
        };
        assert_eq!(barrier.old_layout, vk::ImageLayout::GENERAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::GENERAL);
        stream.destroy(&mut ctx);
    }

    #[test]
    #[should_panic(expected = "outside its declared usage")]
    fn test_undeclared_usage_panics() {
        let mut ctx = headless_context();
        let texture = ctx
            .create_texture(TextureCreateInfo::texture_2d(
                TextureUsage::SAMPLE,
                vk::Format::R8G8B8A8_UNORM,
                16,
                16,
                1,
                false,
            ))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.register_uav_texture(&mut ctx, texture);
    }

    #[test]
    fn test_residency_follows_stream_lifecycle() {
        let mut ctx = headless_context();
        let buffer = ctx
            .create_buffer(BufferCreateInfo::structured(64, false))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.register_srv_buffer(&mut ctx, buffer);
        stream.register_srv_buffer(&mut ctx, buffer);
        assert_eq!(ctx.buffer(buffer).residency().recording, 1);

        submit(&mut ctx, &mut [&mut stream]);
        assert_eq!(ctx.buffer(buffer).residency().recording, 0);
        assert_eq!(ctx.buffer(buffer).residency().pending, 1);

        stream.reset(&mut ctx);
        assert!(!ctx.buffer(buffer).residency().in_use());
        assert_eq!(stream.state(), StreamState::Initial);
        assert_eq!(stream.touched_resources(), 0);
    }

    #[test]
    fn test_dispatch_without_pipeline_is_a_no_op() {
        let mut ctx = headless_context();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        let recorded = stream.commands().len();
        stream.dispatch(&mut ctx, 1, 1, 1);
        assert_eq!(stream.commands().len(), recorded);
        stream.destroy(&mut ctx);
    }

    #[test]
    fn test_dispatch_binds_pipeline_once() {
        let mut ctx = headless_context();
        let shader = ctx
            .compute_shader("cull", &Default::default())
            .unwrap();
        let pipeline = ctx.compute_pipeline(shader).unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.set_compute_pipeline(pipeline);
        stream.dispatch(&mut ctx, 4, 1, 1);
        stream.dispatch(&mut ctx, 4, 1, 1);
        let binds = stream
            .commands()
            .iter()
            .filter(|command| matches!(command, Command::BindPipeline { .. }))
            .count();
        let dispatches = stream
            .commands()
            .iter()
            .filter(|command| matches!(command, Command::Dispatch { .. }))
            .count();
        assert_eq!(binds, 1);
        assert_eq!(dispatches, 2);

        stream.reset_bind_and_render_states();
        stream.set_compute_pipeline(pipeline);
        stream.dispatch(&mut ctx, 1, 1, 1);
        let binds = stream
            .commands()
            .iter()
            .filter(|command| matches!(command, Command::BindPipeline { .. }))
            .count();
        assert_eq!(binds, 2);
        stream.destroy(&mut ctx);
    }

    #[test]
    #[should_panic(expected = "exceed")]
    fn test_oversized_push_constants_panic() {
        let mut ctx = headless_context();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.push_constants(&[0u32; 17]);
    }

    #[test]
    fn test_zones_write_paired_timestamps() {
        let mut ctx = headless_context();
        let pool = ctx
            .device_mut()
            .create_query_pool(QueryKind::Timestamp, 4)
            .unwrap();
        ctx.timestamps.begin_frame(Some(pool), 4);

        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.begin_zone(&mut ctx, "Outer");
        stream.begin_zone(&mut ctx, "Inner");
        stream.end_zone(&mut ctx);
        stream.end_zone(&mut ctx);
        // out of queries: skipped on both ends
        stream.begin_zone(&mut ctx, "Dropped");
        stream.end_zone(&mut ctx);

        let names: Vec<Option<&str>> = stream
            .timestamps()
            .iter()
            .map(|mark| mark.name.as_deref())
            .collect();
        assert_eq!(names, vec![Some("Outer"), Some("Inner"), None, None]);
        stream.destroy(&mut ctx);
    }

    #[test]
    fn test_markers_respect_capabilities() {
        let mut capabilities = crate::device::HeadlessDeviceConfiguration::default().capabilities;
        capabilities.debug_labels = false;
        let mut ctx = crate::context::testing::headless_context_with(capabilities);
        let mut stream = CommandStream::new(Some("Quiet"));
        stream.begin(&mut ctx).unwrap();
        stream.marker_begin(&ctx, "Marker");
        stream.marker_end(&ctx);
        assert!(!stream.commands().iter().any(|command| matches!(
            command,
            Command::BeginLabel(_) | Command::EndLabel
        )));
        stream.destroy(&mut ctx);
    }
}
