use std::collections::HashSet;

use anyhow::Result;
use ash::vk;
use bytemuck::Pod;
use derivative::Derivative;
#[cfg(feature = "log-lifetimes")]
use tracing::trace;
use tracing::warn;

use crate::command::CommandStream;
use crate::descriptor::{DescriptorCapacities, DescriptorTable};
use crate::device::{Capabilities, Device};
use crate::pipelines::{
    ComputePipelineCache, ComputePipelineId, GraphicsPipelineCache, GraphicsPipelineDesc,
    GraphicsPipelineId,
};
use crate::query::TimestampAllocator;
use crate::resource::{
    Buffer, BufferCreateInfo, BufferHandle, Resources, SamplerCache, SamplerState, Texture,
    TextureCreateInfo, TextureHandle,
};
use crate::shader::{ShaderCache, ShaderCompiler, ShaderDefines, ShaderId};
use crate::traits::Destructible;
use crate::usage::TextureUsage;

#[derive(Debug, Clone, PartialEq)]
pub struct GpuContextConfiguration {
    pub descriptor_capacities: DescriptorCapacities,
    /// Only takes effect if the device supports it
    pub pipeline_statistics: bool,
}

impl Default for GpuContextConfiguration {
    fn default() -> Self {
        Self {
            descriptor_capacities: DescriptorCapacities::default(),
            pipeline_statistics: true,
        }
    }
}

impl GpuContextConfiguration {
    pub fn with_descriptor_capacities(mut self, capacities: DescriptorCapacities) -> Self {
        self.descriptor_capacities = capacities;
        self
    }

    pub fn with_pipeline_statistics(mut self, enabled: bool) -> Self {
        self.pipeline_statistics = enabled;
        self
    }
}

/// Owns the device and everything created through it.
///
/// Constructed once and passed by reference to every recording call.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct GpuContext<D: Device> {
    #[derivative(Debug = "ignore")]
    pub(crate) device: D,
    pub(crate) resources: Resources,
    pub(crate) descriptors: DescriptorTable,
    pub(crate) samplers: SamplerCache,
    #[derivative(Debug = "ignore")]
    pub(crate) shaders: ShaderCache,
    pub(crate) graphics_pipelines: GraphicsPipelineCache,
    pub(crate) compute_pipelines: ComputePipelineCache,
    pub(crate) timestamps: TimestampAllocator,
    pub(crate) config: GpuContextConfiguration,
}

impl<D: Device> GpuContext<D> {
    pub fn new(
        mut device: D,
        compiler: Box<dyn ShaderCompiler>,
        config: GpuContextConfiguration,
    ) -> Result<Self> {
        let descriptors = DescriptorTable::new(&mut device, &config.descriptor_capacities)?;
        Ok(Self {
            device,
            resources: Resources::default(),
            descriptors,
            samplers: SamplerCache::default(),
            shaders: ShaderCache::new(compiler),
            graphics_pipelines: GraphicsPipelineCache::default(),
            compute_pipelines: ComputePipelineCache::default(),
            timestamps: TimestampAllocator::default(),
            config,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn capabilities(&self) -> &Capabilities {
        self.device.capabilities()
    }

    pub fn config(&self) -> &GpuContextConfiguration {
        &self.config
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    pub fn timestamps_mut(&mut self) -> &mut TimestampAllocator {
        &mut self.timestamps
    }

    /// # Panics
    /// On a stale handle
    pub fn buffer(&self, handle: BufferHandle) -> &Buffer {
        self.resources.buffer(handle)
    }

    /// # Panics
    /// On a stale handle
    pub fn texture(&self, handle: TextureHandle) -> &Texture {
        self.resources.texture(handle)
    }

    pub fn create_buffer(&mut self, info: BufferCreateInfo) -> Result<BufferHandle> {
        let buffer = Buffer::new(&mut self.device, info)?;
        Ok(self.resources.insert_buffer(buffer))
    }

    pub fn create_texture(&mut self, info: TextureCreateInfo) -> Result<TextureHandle> {
        let texture = Texture::new(&mut self.device, info)?;
        Ok(self.resources.insert_texture(texture))
    }

    /// Tracks an image owned elsewhere, e.g. a swapchain image. The core never frees it.
    pub fn import_texture(
        &mut self,
        image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: TextureUsage,
        name: Option<&str>,
    ) -> TextureHandle {
        self.resources.insert_texture(Texture::import(
            image,
            format,
            extent,
            usage,
            name.map(str::to_string),
        ))
    }

    /// Frees the buffer, or defers it while submitted streams still reference it.
    ///
    /// # Panics
    /// If a stream that has not been submitted yet touched the buffer
    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        let buffer = self.resources.buffer_mut(handle);
        assert_eq!(
            buffer.residency.recording,
            0,
            "Buffer {:?} destroyed while an unsubmitted stream still uses it",
            buffer.name()
        );
        if buffer.residency.pending > 0 {
            warn!(
                name = ?buffer.name(),
                pending = buffer.residency.pending,
                "Deferring buffer destruction until its streams retire"
            );
            buffer.residency.doomed = true;
            return;
        }
        if let Some(mut buffer) = self.resources.remove_buffer(handle) {
            buffer.destroy(&mut self.device, &mut self.descriptors);
        }
    }

    /// Frees the texture, or defers it while submitted streams still reference it.
    ///
    /// # Panics
    /// If a stream that has not been submitted yet touched the texture
    pub fn destroy_texture(&mut self, handle: TextureHandle) {
        let texture = self.resources.texture_mut(handle);
        assert_eq!(
            texture.residency.recording,
            0,
            "Texture {:?} destroyed while an unsubmitted stream still uses it",
            texture.name()
        );
        if texture.residency.pending > 0 {
            warn!(
                name = ?texture.name(),
                pending = texture.residency.pending,
                "Deferring texture destruction until its streams retire"
            );
            texture.residency.doomed = true;
            return;
        }
        if let Some(mut texture) = self.resources.remove_texture(handle) {
            texture.destroy(&mut self.device, &mut self.descriptors);
        }
    }

    /// Frees deferred resources whose streams have all retired
    pub fn collect_garbage(&mut self) -> usize {
        let (buffers, textures) = self.resources.take_collectable();
        let collected = buffers.len() + textures.len();
        for mut buffer in buffers {
            buffer.destroy(&mut self.device, &mut self.descriptors);
        }
        for mut texture in textures {
            texture.destroy(&mut self.device, &mut self.descriptors);
        }
        collected
    }

    pub fn bind_buffer_srv(&mut self, handle: BufferHandle) -> Result<u32> {
        self.resources
            .buffer_mut(handle)
            .bind_srv(&mut self.device, &mut self.descriptors)
    }

    pub fn bind_buffer_uav(&mut self, handle: BufferHandle) -> Result<u32> {
        self.resources
            .buffer_mut(handle)
            .bind_uav(&mut self.device, &mut self.descriptors)
    }

    pub fn bind_texture_srv(&mut self, handle: TextureHandle) -> Result<u32> {
        self.resources
            .texture_mut(handle)
            .bind_srv(&mut self.device, &mut self.descriptors)
    }

    pub fn bind_texture_uav(&mut self, handle: TextureHandle) -> Result<u32> {
        self.resources
            .texture_mut(handle)
            .bind_uav(&mut self.device, &mut self.descriptors)
    }

    pub fn bind_texture_uav_layer(&mut self, handle: TextureHandle, layer: u32) -> Result<u32> {
        self.resources
            .texture_mut(handle)
            .bind_uav_layer(&mut self.device, &mut self.descriptors, layer)
    }

    /// Descriptor slot of a sampler with `state`, created on first request
    pub fn sampler(&mut self, state: &SamplerState) -> Result<u32> {
        self.samplers
            .get(&mut self.device, &mut self.descriptors, state)
    }

    pub fn graphics_shader(&mut self, name: &str, defines: &ShaderDefines) -> Option<ShaderId> {
        self.shaders.get_graphics(name, defines)
    }

    pub fn mesh_shader(&mut self, name: &str, defines: &ShaderDefines) -> Option<ShaderId> {
        self.shaders.get_mesh(name, defines)
    }

    pub fn compute_shader(&mut self, name: &str, defines: &ShaderDefines) -> Option<ShaderId> {
        self.shaders.get_compute(name, defines)
    }

    pub fn shaders(&self) -> &ShaderCache {
        &self.shaders
    }

    pub fn graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> Option<GraphicsPipelineId> {
        self.graphics_pipelines
            .get(&mut self.device, &self.shaders, desc)
    }

    pub fn compute_pipeline(&mut self, shader: ShaderId) -> Option<ComputePipelineId> {
        self.compute_pipelines
            .get(&mut self.device, &self.shaders, shader)
    }

    /// Recompiles shaders built from `changed` files, then every pipeline using them.
    ///
    /// The caller must make sure no submitted stream still uses the old pipelines.
    pub fn reload_shaders(&mut self, changed: &HashSet<String>) -> HashSet<ShaderId> {
        let recreated = self.shaders.recreate_on_shader_changes(changed);
        if !recreated.is_empty() {
            self.graphics_pipelines
                .recreate_on_shader_changed(&mut self.device, &self.shaders, &recreated);
            self.compute_pipelines
                .recreate_on_shader_changed(&mut self.device, &self.shaders, &recreated);
        }
        recreated
    }

    /// Records queued descriptor table writes into `stream`
    pub fn flush_descriptor_writes(&mut self, stream: &mut CommandStream) -> Result<()> {
        self.descriptors.flush(&mut self.device, stream)
    }

    /// The stream holding the flushed descriptor writes was submitted
    pub fn confirm_descriptor_writes(&mut self) {
        self.descriptors.confirm_flushed();
    }

    /// The stream holding the flushed descriptor writes was discarded, queue them again
    pub fn requeue_descriptor_writes(&mut self) {
        self.descriptors.requeue_flushed();
    }

    /// Writes straight into a host visible buffer.
    ///
    /// # Panics
    /// If the write overruns the buffer
    pub fn write_buffer<T: Pod>(&mut self, handle: BufferHandle, offset: u64, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = self.resources.buffer(handle);
        assert!(
            offset + bytes.len() as u64 <= buffer.size(),
            "Write of {} bytes at offset {offset} overruns buffer {:?} of {} bytes",
            bytes.len(),
            buffer.name(),
            buffer.size()
        );
        let raw = buffer.handle();
        self.device.write_buffer(raw, offset, bytes)
    }
}

impl<D: Device> Destructible for GpuContext<D> {
    fn destroy(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            warn!(?err, "Failed to wait for the device before teardown");
        }
        let (buffers, textures) = self.resources.take_all();
        #[cfg(feature = "log-lifetimes")]
        trace!(
            "Destroying context with {} buffers and {} textures",
            buffers.len(),
            textures.len()
        );
        for mut buffer in buffers {
            buffer.destroy(&mut self.device, &mut self.descriptors);
        }
        for mut texture in textures {
            texture.destroy(&mut self.device, &mut self.descriptors);
        }
        self.samplers
            .destroy(&mut self.device, &mut self.descriptors);
        self.graphics_pipelines.destroy(&mut self.device);
        self.compute_pipelines.destroy(&mut self.device);
        self.descriptors.destroy(&mut self.device);
    }
}

#[cfg(feature = "raii")]
impl<D: Device> Drop for GpuContext<D> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::command::{Command, StreamState};
    use crate::device::{HeadlessDevice, HeadlessDeviceConfiguration, Submission};
    use crate::shader::{InMemoryShaderCompiler, ShaderStage};

    pub(crate) type TestContext = GpuContext<HeadlessDevice>;

    pub(crate) fn headless_context() -> TestContext {
        headless_context_with(HeadlessDeviceConfiguration::default().capabilities)
    }

    pub(crate) fn headless_context_with(capabilities: Capabilities) -> TestContext {
        let device = HeadlessDevice::new(
            HeadlessDeviceConfiguration::default().with_capabilities(capabilities),
        );
        let compiler = InMemoryShaderCompiler::default();
        compiler
            .add_source("triangle", &[ShaderStage::Vertex, ShaderStage::Pixel])
            .add_source("meshlet", &[ShaderStage::Mesh, ShaderStage::Pixel])
            .add_source("cull", &[ShaderStage::Compute]);
        let config = GpuContextConfiguration::default()
            .with_descriptor_capacities(DescriptorCapacities {
                sampled_images: 64,
                storage_images: 64,
                storage_buffers: 64,
                samplers: 16,
            })
            .with_pipeline_statistics(true);
        GpuContext::new(device, Box::new(compiler), config).unwrap()
    }

    /// Ends, marks and executes `streams` as one submission
    pub(crate) fn submit(ctx: &mut TestContext, streams: &mut [&mut CommandStream]) {
        for stream in streams.iter_mut() {
            if stream.state() == StreamState::Recording {
                stream.end().unwrap();
            }
            stream.mark_submitted(ctx);
        }
        let fence = ctx.device.create_fence(false).unwrap();
        let commands: Vec<&[Command]> = streams.iter().map(|stream| stream.commands()).collect();
        ctx.device
            .submit(Submission {
                streams: commands,
                wait: None,
                signal: None,
                fence,
            })
            .unwrap();
        ctx.device.destroy_fence(fence);
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{headless_context, submit};
    use super::*;
    use crate::descriptor::DescriptorKind;

    #[test]
    fn test_destroy_is_deferred_while_pending() {
        let mut ctx = headless_context();
        let buffer = ctx
            .create_buffer(BufferCreateInfo::structured(64, false))
            .unwrap();
        ctx.bind_buffer_srv(buffer).unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.register_srv_buffer(&mut ctx, buffer);
        submit(&mut ctx, &mut [&mut stream]);

        ctx.destroy_buffer(buffer);
        assert!(ctx.resources.try_buffer(buffer).is_some());
        assert_eq!(ctx.collect_garbage(), 0);

        stream.reset(&mut ctx);
        assert_eq!(ctx.collect_garbage(), 1);
        assert!(ctx.resources.try_buffer(buffer).is_none());
        assert_eq!(ctx.descriptors.allocated(DescriptorKind::StorageBuffer), 0);
        stream.destroy(&mut ctx);
    }

    #[test]
    #[should_panic(expected = "unsubmitted stream")]
    fn test_destroy_while_recording_panics() {
        let mut ctx = headless_context();
        let buffer = ctx
            .create_buffer(BufferCreateInfo::structured(64, false))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.register_srv_buffer(&mut ctx, buffer);
        ctx.destroy_buffer(buffer);
    }

    #[test]
    #[should_panic(expected = "Stale buffer handle")]
    fn test_stale_handle_panics() {
        let mut ctx = headless_context();
        let buffer = ctx.create_buffer(BufferCreateInfo::staging(16)).unwrap();
        ctx.destroy_buffer(buffer);
        ctx.buffer(buffer);
    }

    #[test]
    fn test_write_buffer_reaches_host_memory() {
        let mut ctx = headless_context();
        let buffer = ctx.create_buffer(BufferCreateInfo::staging(16)).unwrap();
        ctx.write_buffer(buffer, 4, &[0xAABB_CCDDu32]).unwrap();
        let raw = ctx.buffer(buffer).handle();
        assert_eq!(
            &ctx.device().read_buffer(raw).unwrap()[4..8],
            &0xAABB_CCDDu32.to_le_bytes()
        );

        let device_local = ctx
            .create_buffer(BufferCreateInfo::structured(16, false))
            .unwrap();
        assert!(ctx.write_buffer(device_local, 0, &[1u32]).is_err());
    }

    #[test]
    fn test_teardown_frees_everything() {
        let mut ctx = headless_context();
        let texture = ctx
            .create_texture(TextureCreateInfo::texture_2d(
                TextureUsage::SAMPLE,
                vk::Format::R8G8B8A8_UNORM,
                8,
                8,
                1,
                true,
            ))
            .unwrap();
        ctx.bind_texture_srv(texture).unwrap();
        ctx.sampler(&SamplerState::linear()).unwrap();
        let shader = ctx.compute_shader("cull", &ShaderDefines::new()).unwrap();
        ctx.compute_pipeline(shader).unwrap();

        ctx.destroy();
        assert_eq!(ctx.device().live_objects(), 0);
    }
}
