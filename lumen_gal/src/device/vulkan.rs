//! [`Device`] on top of an externally created Vulkan 1.3 device.
//!
//! Memory comes from [`gpu_allocator`], descriptors live in a single
//! `VK_EXT_descriptor_buffer` and recorded streams are encoded into primary
//! command buffers at submission.

use std::collections::HashMap;
use std::ffi::CString;

use anyhow::Result;
use ash::vk;
use derivative::Derivative;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
#[cfg(feature = "log-lifetimes")]
use tracing::trace;
use tracing::warn;

use super::{
    Capabilities, DescriptorInfo, DescriptorSizes, Device, MemoryLocation, QueryKind,
    RawBufferInfo, RawImageInfo, RawViewInfo, Submission,
};
use crate::command::stream::MAX_PUSH_CONSTANT_SIZE;
use crate::command::{AttachmentClear, AttachmentInfo, Command, RenderingInfo};
use crate::descriptor::{
    DescriptorCapacities, DescriptorHeapLayout, DescriptorKind, DescriptorRange,
};
use crate::pipelines::GraphicsPipelineDesc;
use crate::resource::SamplerState;
use crate::shader::ShaderBinary;
use crate::traits::Destructible;
use crate::GalError;

/// Everything the device needs from whoever created the Vulkan objects
#[derive(Clone)]
pub struct VulkanDeviceCreateInfo {
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue_family: u32,
    /// `VK_EXT_mesh_shader` was enabled on the device
    pub mesh_shading: bool,
    /// `VK_EXT_debug_utils` was enabled on the instance
    pub debug_utils: bool,
    /// The `pipelineStatisticsQuery` feature was enabled on the device
    pub pipeline_statistics: bool,
}

impl From<MemoryLocation> for gpu_allocator::MemoryLocation {
    fn from(value: MemoryLocation) -> Self {
        match value {
            MemoryLocation::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
            MemoryLocation::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
            MemoryLocation::GpuToCpu => gpu_allocator::MemoryLocation::GpuToCpu,
        }
    }
}

/// Command buffers of one submission, recycled once its fence signals
#[derive(Debug)]
struct InFlight {
    fence: vk::Fence,
    command_buffers: Vec<vk::CommandBuffer>,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanDevice {
    #[derivative(Debug = "ignore")]
    device: ash::Device,
    #[derivative(Debug = "ignore")]
    descriptor_buffer: ash::ext::descriptor_buffer::Device,
    #[derivative(Debug = "ignore")]
    mesh_shader: Option<ash::ext::mesh_shader::Device>,
    #[derivative(Debug = "ignore")]
    debug_utils: Option<ash::ext::debug_utils::Device>,
    #[derivative(Debug = "ignore")]
    allocator: Option<Allocator>,
    queue: vk::Queue,
    capabilities: Capabilities,
    buffers: HashMap<vk::Buffer, Allocation>,
    images: HashMap<vk::Image, Allocation>,
    query_pools: HashMap<vk::QueryPool, QueryKind>,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    command_pool: vk::CommandPool,
    free_command_buffers: Vec<vk::CommandBuffer>,
    in_flight: Vec<InFlight>,
}

impl VulkanDevice {
    pub fn new(info: VulkanDeviceCreateInfo) -> Result<Self> {
        let mut descriptor_properties = vk::PhysicalDeviceDescriptorBufferPropertiesEXT::default();
        let mut properties =
            vk::PhysicalDeviceProperties2::default().push_next(&mut descriptor_properties);
        unsafe {
            info.instance
                .get_physical_device_properties2(info.physical_device, &mut properties)
        };
        let limits = properties.properties.limits;
        let capabilities = Capabilities {
            debug_labels: info.debug_utils,
            mesh_shading: info.mesh_shading,
            timestamps: limits.timestamp_compute_and_graphics == vk::TRUE,
            pipeline_statistics: info.pipeline_statistics,
            timestamp_period: limits.timestamp_period,
            graphics_queue_family: info.graphics_queue_family,
            present_queue_family: info.present_queue_family,
            descriptor_sizes: DescriptorSizes {
                sampled_image: descriptor_properties.sampled_image_descriptor_size as u64,
                storage_image: descriptor_properties.storage_image_descriptor_size as u64,
                storage_buffer: descriptor_properties.storage_buffer_descriptor_size as u64,
                sampler: descriptor_properties.sampler_descriptor_size as u64,
            },
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: info.instance.clone(),
            device: info.device.clone(),
            physical_device: info.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;
        let command_pool = unsafe {
            info.device.create_command_pool(
                &vk::CommandPoolCreateInfo {
                    flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                    queue_family_index: info.graphics_queue_family,
                    ..Default::default()
                },
                None,
            )?
        };
        #[cfg(feature = "log-lifetimes")]
        trace!("Creating VkCommandPool {:?}", command_pool);

        Ok(Self {
            descriptor_buffer: ash::ext::descriptor_buffer::Device::new(&info.instance, &info.device),
            mesh_shader: info
                .mesh_shading
                .then(|| ash::ext::mesh_shader::Device::new(&info.instance, &info.device)),
            debug_utils: info
                .debug_utils
                .then(|| ash::ext::debug_utils::Device::new(&info.instance, &info.device)),
            device: info.device,
            allocator: Some(allocator),
            queue: info.graphics_queue,
            capabilities,
            buffers: HashMap::new(),
            images: HashMap::new(),
            query_pools: HashMap::new(),
            set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            command_pool,
            free_command_buffers: Vec::new(),
            in_flight: Vec::new(),
        })
    }

    fn allocator(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Vulkan device already destroyed"))
    }

    fn set_name<H: vk::Handle>(&self, handle: H, name: Option<&str>) {
        let (Some(debug_utils), Some(name)) = (self.debug_utils.as_ref(), name) else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        if let Err(err) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            warn!(?err, "Failed to name Vulkan object");
        }
    }

    fn allocate(
        &mut self,
        name: Option<&str>,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        Ok(self.allocator()?.allocate(&AllocationCreateDesc {
            name: name.unwrap_or("Unnamed"),
            requirements,
            location: location.into(),
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?)
    }

    fn free(&mut self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.as_mut() {
            if let Err(err) = allocator.free(allocation) {
                warn!(?err, "Failed to free allocation");
            }
        }
    }

    fn buffer_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        unsafe {
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        }
    }

    fn shader_module(&self, binary: &ShaderBinary) -> Result<vk::ShaderModule> {
        Ok(unsafe {
            self.device.create_shader_module(
                &vk::ShaderModuleCreateInfo::default().code(&binary.spirv),
                None,
            )?
        })
    }

    /// Returns command buffers of retired submissions to the free list
    fn recycle(&mut self) -> Result<()> {
        let mut index = 0;
        while index < self.in_flight.len() {
            if unsafe { self.device.get_fence_status(self.in_flight[index].fence)? } {
                let retired = self.in_flight.swap_remove(index);
                self.free_command_buffers.extend(retired.command_buffers);
            } else {
                index += 1;
            }
        }
        Ok(())
    }

    fn command_buffer(&mut self) -> Result<vk::CommandBuffer> {
        if let Some(command_buffer) = self.free_command_buffers.pop() {
            unsafe {
                self.device
                    .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?
            };
            return Ok(command_buffer);
        }
        let allocated = unsafe {
            self.device.allocate_command_buffers(&vk::CommandBufferAllocateInfo {
                command_pool: self.command_pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: 1,
                ..Default::default()
            })?
        };
        allocated
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Driver returned no command buffer"))
    }

    fn encode(&self, command_buffer: vk::CommandBuffer, commands: &[Command]) -> Result<()> {
        unsafe {
            self.device.begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?
        };
        let mut index = 0;
        while index < commands.len() {
            // consecutive barriers are batched into one dependency
            let batch_end = commands[index..]
                .iter()
                .position(|command| !command.is_barrier())
                .map_or(commands.len(), |offset| index + offset);
            if batch_end > index {
                self.encode_barriers(command_buffer, &commands[index..batch_end]);
                index = batch_end;
                continue;
            }
            self.encode_command(command_buffer, &commands[index])?;
            index += 1;
        }
        unsafe { self.device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    fn encode_barriers(&self, command_buffer: vk::CommandBuffer, barriers: &[Command]) {
        let mut buffer_barriers = Vec::new();
        let mut image_barriers = Vec::new();
        for barrier in barriers {
            match barrier {
                Command::BufferBarrier(barrier) => buffer_barriers.push(
                    vk::BufferMemoryBarrier2::default()
                        .src_stage_mask(barrier.src_stage)
                        .src_access_mask(barrier.src_access)
                        .dst_stage_mask(barrier.dst_stage)
                        .dst_access_mask(barrier.dst_access)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(barrier.buffer)
                        .offset(barrier.offset)
                        .size(barrier.size),
                ),
                Command::ImageBarrier(barrier) => image_barriers.push(
                    vk::ImageMemoryBarrier2::default()
                        .src_stage_mask(barrier.src_stage)
                        .src_access_mask(barrier.src_access)
                        .dst_stage_mask(barrier.dst_stage)
                        .dst_access_mask(barrier.dst_access)
                        .old_layout(barrier.old_layout)
                        .new_layout(barrier.new_layout)
                        .src_queue_family_index(barrier.src_queue_family)
                        .dst_queue_family_index(barrier.dst_queue_family)
                        .image(barrier.image)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: barrier.aspect,
                            base_mip_level: barrier.base_mip,
                            level_count: barrier.mip_count,
                            base_array_layer: barrier.base_layer,
                            layer_count: barrier.layer_count,
                        }),
                ),
                _ => {}
            }
        }
        let dependency = vk::DependencyInfo::default()
            .buffer_memory_barriers(&buffer_barriers)
            .image_memory_barriers(&image_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(command_buffer, &dependency) };
    }

    fn attachment(info: &AttachmentInfo) -> vk::RenderingAttachmentInfo<'static> {
        let clear_value = match info.clear {
            Some(AttachmentClear::Color(color)) => vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            },
            Some(AttachmentClear::DepthStencil { depth, stencil }) => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
            None => vk::ClearValue::default(),
        };
        vk::RenderingAttachmentInfo::default()
            .image_view(info.view)
            .image_layout(info.layout)
            .load_op(info.load_op)
            .store_op(info.store_op)
            .clear_value(clear_value)
    }

    fn begin_rendering(&self, command_buffer: vk::CommandBuffer, info: &RenderingInfo) {
        let color: Vec<vk::RenderingAttachmentInfo> =
            info.color.iter().map(Self::attachment).collect();
        let depth = info.depth.as_ref().map(Self::attachment);
        let mut rendering = vk::RenderingInfo::default()
            .render_area(info.area)
            .layer_count(info.layer_count)
            .color_attachments(&color);
        if let Some(depth) = depth.as_ref() {
            rendering = rendering.depth_attachment(depth);
        }
        unsafe { self.device.cmd_begin_rendering(command_buffer, &rendering) };
    }

    fn encode_command(&self, command_buffer: vk::CommandBuffer, command: &Command) -> Result<()> {
        let device = &self.device;
        unsafe {
            match command {
                Command::BufferBarrier(_) | Command::ImageBarrier(_) => {
                    self.encode_barriers(command_buffer, std::slice::from_ref(command))
                }
                Command::CopyBuffer { src, dst, regions } => {
                    device.cmd_copy_buffer(command_buffer, *src, *dst, regions)
                }
                Command::CopyBufferToImage {
                    src,
                    dst,
                    layout,
                    region,
                } => device.cmd_copy_buffer_to_image(
                    command_buffer,
                    *src,
                    *dst,
                    *layout,
                    std::slice::from_ref(region),
                ),
                Command::BlitImage(blit) => {
                    let offsets = |extent: vk::Extent3D| {
                        [
                            vk::Offset3D::default(),
                            vk::Offset3D {
                                x: extent.width as i32,
                                y: extent.height as i32,
                                z: extent.depth as i32,
                            },
                        ]
                    };
                    let subresource = |mip_level| vk::ImageSubresourceLayers {
                        aspect_mask: blit.aspect,
                        mip_level,
                        base_array_layer: 0,
                        layer_count: blit.layer_count,
                    };
                    device.cmd_blit_image(
                        command_buffer,
                        blit.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        blit.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[vk::ImageBlit {
                            src_subresource: subresource(blit.src_mip),
                            src_offsets: offsets(blit.src_extent),
                            dst_subresource: subresource(blit.dst_mip),
                            dst_offsets: offsets(blit.dst_extent),
                        }],
                        vk::Filter::LINEAR,
                    )
                }
                Command::FillBuffer {
                    buffer,
                    offset,
                    size,
                    data,
                } => device.cmd_fill_buffer(command_buffer, *buffer, *offset, *size, *data),
                Command::BeginRendering(info) => self.begin_rendering(command_buffer, info),
                Command::EndRendering => device.cmd_end_rendering(command_buffer),
                Command::BindPipeline {
                    bind_point,
                    pipeline,
                } => device.cmd_bind_pipeline(command_buffer, *bind_point, *pipeline),
                Command::BindDescriptorTable { buffer } => {
                    let binding = vk::DescriptorBufferBindingInfoEXT::default()
                        .address(self.buffer_address(*buffer))
                        .usage(
                            vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT
                                | vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT,
                        );
                    self.descriptor_buffer
                        .cmd_bind_descriptor_buffers(command_buffer, &[binding]);
                    for bind_point in [vk::PipelineBindPoint::GRAPHICS, vk::PipelineBindPoint::COMPUTE] {
                        self.descriptor_buffer.cmd_set_descriptor_buffer_offsets(
                            command_buffer,
                            bind_point,
                            self.pipeline_layout,
                            0,
                            &[0],
                            &[0],
                        );
                    }
                }
                Command::SetViewport(viewport) => {
                    device.cmd_set_viewport(command_buffer, 0, std::slice::from_ref(viewport))
                }
                Command::SetScissor(scissor) => {
                    device.cmd_set_scissor(command_buffer, 0, std::slice::from_ref(scissor))
                }
                Command::PushConstants(bytes) => device.cmd_push_constants(
                    command_buffer,
                    self.pipeline_layout,
                    vk::ShaderStageFlags::ALL,
                    0,
                    bytes,
                ),
                Command::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => device.cmd_draw(
                    command_buffer,
                    *vertex_count,
                    *instance_count,
                    *first_vertex,
                    *first_instance,
                ),
                Command::DrawMeshTasks { x, y, z } => {
                    let mesh_shader = self
                        .mesh_shader
                        .as_ref()
                        .ok_or(GalError::NoCapability("mesh shading"))?;
                    mesh_shader.cmd_draw_mesh_tasks(command_buffer, *x, *y, *z)
                }
                Command::Dispatch { x, y, z } => device.cmd_dispatch(command_buffer, *x, *y, *z),
                Command::BeginLabel(name) => {
                    if let Some(debug_utils) = self.debug_utils.as_ref() {
                        let name = CString::new(name.as_str()).unwrap_or_default();
                        let label = vk::DebugUtilsLabelEXT::default().label_name(&name);
                        debug_utils.cmd_begin_debug_utils_label(command_buffer, &label);
                    }
                }
                Command::EndLabel => {
                    if let Some(debug_utils) = self.debug_utils.as_ref() {
                        debug_utils.cmd_end_debug_utils_label(command_buffer);
                    }
                }
                Command::WriteTimestamp { pool, query } => device.cmd_write_timestamp2(
                    command_buffer,
                    vk::PipelineStageFlags2::ALL_COMMANDS,
                    *pool,
                    *query,
                ),
                Command::BeginQuery { pool, query } => device.cmd_begin_query(
                    command_buffer,
                    *pool,
                    *query,
                    vk::QueryControlFlags::empty(),
                ),
                Command::EndQuery { pool, query } => {
                    device.cmd_end_query(command_buffer, *pool, *query)
                }
            }
        }
        Ok(())
    }
}

impl Device for VulkanDevice {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn create_buffer(&mut self, info: &RawBufferInfo) -> Result<vk::Buffer> {
        let handle = unsafe {
            self.device.create_buffer(
                &vk::BufferCreateInfo::default()
                    .size(info.size.max(1))
                    .usage(info.usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE),
                None,
            )?
        };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(handle) };
        let allocation = match self.allocate(info.name, requirements, info.location, true) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_buffer(handle, None) };
                return Err(err);
            }
        };
        unsafe {
            self.device
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())?
        };
        #[cfg(feature = "log-lifetimes")]
        trace!("Creating VkBuffer {:?} ({:?})", handle, info.name);
        self.set_name(handle, info.name);
        self.buffers.insert(handle, allocation);
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        #[cfg(feature = "log-lifetimes")]
        trace!("Destroying VkBuffer {:?}", buffer);
        unsafe { self.device.destroy_buffer(buffer, None) };
        if let Some(allocation) = self.buffers.remove(&buffer) {
            self.free(allocation);
        }
    }

    fn write_buffer(&mut self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let allocation = self
            .buffers
            .get_mut(&buffer)
            .ok_or(GalError::InvalidHandle)?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or(GalError::InvalidMemoryLocation)?;
        let offset = offset as usize;
        mapped
            .get_mut(offset..offset + data.len())
            .ok_or_else(|| anyhow::anyhow!("Write out of bounds"))?
            .copy_from_slice(data);
        Ok(())
    }

    fn create_image(&mut self, info: &RawImageInfo) -> Result<vk::Image> {
        let mut usage = info.usage;
        if info.mip_levels > 1 {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        }
        let flags = if info.cube_compatible {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let handle = unsafe {
            self.device.create_image(
                &vk::ImageCreateInfo::default()
                    .flags(flags)
                    .image_type(info.image_type)
                    .format(info.format)
                    .extent(info.extent)
                    .mip_levels(info.mip_levels)
                    .array_layers(info.array_layers)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED),
                None,
            )?
        };
        let requirements = unsafe { self.device.get_image_memory_requirements(handle) };
        let allocation =
            match self.allocate(info.name, requirements, MemoryLocation::GpuOnly, false) {
                Ok(allocation) => allocation,
                Err(err) => {
                    unsafe { self.device.destroy_image(handle, None) };
                    return Err(err);
                }
            };
        unsafe {
            self.device
                .bind_image_memory(handle, allocation.memory(), allocation.offset())?
        };
        #[cfg(feature = "log-lifetimes")]
        trace!("Creating VkImage {:?} ({:?})", handle, info.name);
        self.set_name(handle, info.name);
        self.images.insert(handle, allocation);
        Ok(handle)
    }

    fn destroy_image(&mut self, image: vk::Image) {
        #[cfg(feature = "log-lifetimes")]
        trace!("Destroying VkImage {:?}", image);
        unsafe { self.device.destroy_image(image, None) };
        if let Some(allocation) = self.images.remove(&image) {
            self.free(allocation);
        }
    }

    fn create_image_view(&mut self, info: &RawViewInfo) -> Result<vk::ImageView> {
        let view = unsafe {
            self.device.create_image_view(
                &vk::ImageViewCreateInfo::default()
                    .image(info.image)
                    .view_type(info.kind.into())
                    .format(info.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: info.aspect,
                        base_mip_level: info.base_mip,
                        level_count: info.mip_count,
                        base_array_layer: info.base_layer,
                        layer_count: info.layer_count,
                    }),
                None,
            )?
        };
        Ok(view)
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&mut self, state: &SamplerState) -> Result<vk::Sampler> {
        let sampler = unsafe {
            self.device.create_sampler(
                &vk::SamplerCreateInfo::default()
                    .mag_filter(state.mag_filter)
                    .min_filter(state.min_filter)
                    .mipmap_mode(state.mipmap_mode)
                    .address_mode_u(state.address_u)
                    .address_mode_v(state.address_v)
                    .address_mode_w(state.address_w)
                    .mip_lod_bias(state.mip_lod_bias)
                    .anisotropy_enable(state.anisotropy_enable)
                    .max_anisotropy(state.max_anisotropy)
                    .min_lod(state.min_lod)
                    .max_lod(state.max_lod)
                    .border_color(state.border_color),
                None,
            )?
        };
        Ok(sampler)
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn descriptor_heap_layout(
        &mut self,
        capacities: &DescriptorCapacities,
    ) -> Result<DescriptorHeapLayout> {
        let bindings = DescriptorKind::ALL.map(|kind| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(kind.index() as u32)
                .descriptor_type(match kind {
                    DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
                    DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
                    DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
                    DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
                })
                .descriptor_count(capacities.capacity(kind))
                .stage_flags(vk::ShaderStageFlags::ALL)
        });
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND; 4];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let set_layout = unsafe {
            self.device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default()
                    .flags(vk::DescriptorSetLayoutCreateFlags::DESCRIPTOR_BUFFER_EXT)
                    .bindings(&bindings)
                    .push_next(&mut flags_info),
                None,
            )?
        };
        let push_constants = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::ALL,
            offset: 0,
            size: MAX_PUSH_CONSTANT_SIZE as u32,
        };
        let pipeline_layout = unsafe {
            self.device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default()
                    .set_layouts(std::slice::from_ref(&set_layout))
                    .push_constant_ranges(std::slice::from_ref(&push_constants)),
                None,
            )?
        };
        self.set_layout = set_layout;
        self.pipeline_layout = pipeline_layout;

        let size = unsafe {
            self.descriptor_buffer
                .get_descriptor_set_layout_size(set_layout)
        };
        let sizes = self.capabilities.descriptor_sizes;
        let mut ranges = [DescriptorRange {
            offset: 0,
            stride: 0,
            capacity: 0,
        }; 4];
        for kind in DescriptorKind::ALL {
            let offset = unsafe {
                self.descriptor_buffer
                    .get_descriptor_set_layout_binding_offset(set_layout, kind.index() as u32)
            };
            ranges[kind.index()] = DescriptorRange {
                offset,
                stride: sizes.size(kind),
                capacity: capacities.capacity(kind),
            };
        }
        Ok(DescriptorHeapLayout { size, ranges })
    }

    fn descriptor_bytes(&mut self, info: &DescriptorInfo) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; self.capabilities.descriptor_sizes.size(info.kind()) as usize];
        let image_info = |view, layout| vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: layout,
        };
        match info {
            DescriptorInfo::SampledImage(view) => {
                let image = image_info(*view, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                let get = vk::DescriptorGetInfoEXT::default()
                    .ty(vk::DescriptorType::SAMPLED_IMAGE)
                    .data(vk::DescriptorDataEXT {
                        p_sampled_image: &image,
                    });
                unsafe { self.descriptor_buffer.get_descriptor(&get, &mut bytes) };
            }
            DescriptorInfo::StorageImage(view) => {
                let image = image_info(*view, vk::ImageLayout::GENERAL);
                let get = vk::DescriptorGetInfoEXT::default()
                    .ty(vk::DescriptorType::STORAGE_IMAGE)
                    .data(vk::DescriptorDataEXT {
                        p_storage_image: &image,
                    });
                unsafe { self.descriptor_buffer.get_descriptor(&get, &mut bytes) };
            }
            DescriptorInfo::StorageBuffer { buffer, range } => {
                let address = vk::DescriptorAddressInfoEXT::default()
                    .address(self.buffer_address(*buffer))
                    .range(*range)
                    .format(vk::Format::UNDEFINED);
                let get = vk::DescriptorGetInfoEXT::default()
                    .ty(vk::DescriptorType::STORAGE_BUFFER)
                    .data(vk::DescriptorDataEXT {
                        p_storage_buffer: &address,
                    });
                unsafe { self.descriptor_buffer.get_descriptor(&get, &mut bytes) };
            }
            DescriptorInfo::Sampler(sampler) => {
                let get = vk::DescriptorGetInfoEXT::default()
                    .ty(vk::DescriptorType::SAMPLER)
                    .data(vk::DescriptorDataEXT { p_sampler: sampler });
                unsafe { self.descriptor_buffer.get_descriptor(&get, &mut bytes) };
            }
        }
        Ok(bytes)
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc,
        stages: &[ShaderBinary],
    ) -> Result<vk::Pipeline> {
        let mut modules = Vec::with_capacity(stages.len());
        for binary in stages {
            match self.shader_module(binary) {
                Ok(module) => modules.push(module),
                Err(err) => {
                    for module in modules {
                        unsafe { self.device.destroy_shader_module(module, None) };
                    }
                    return Err(err);
                }
            }
        }
        let entry_points: Vec<CString> = stages
            .iter()
            .map(|binary| CString::new(binary.entry_point.as_str()).unwrap_or_default())
            .collect();
        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo> = stages
            .iter()
            .zip(modules.iter())
            .zip(entry_points.iter())
            .map(|((binary, module), entry_point)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(binary.stage.flags())
                    .module(*module)
                    .name(entry_point)
            })
            .collect();

        let color_count = desc.rendering.color_count as usize;
        let color_formats = &desc.rendering.color_formats[..color_count];
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .view_mask(desc.rendering.view_mask)
            .color_attachment_formats(color_formats)
            .depth_attachment_format(desc.rendering.depth_format);
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.input_assembly.topology)
            .primitive_restart_enable(desc.input_assembly.primitive_restart);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let raster = &desc.rasterization;
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(raster.depth_clamp)
            .polygon_mode(raster.polygon_mode)
            .cull_mode(raster.cull_mode)
            .front_face(raster.front_face)
            .depth_bias_enable(raster.depth_bias_enable)
            .depth_bias_constant_factor(raster.depth_bias_constant)
            .depth_bias_clamp(raster.depth_bias_clamp)
            .depth_bias_slope_factor(raster.depth_bias_slope)
            .line_width(raster.line_width);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .min_sample_shading(1.0);
        let depth = &desc.depth_stencil;
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth.depth_test)
            .depth_write_enable(depth.depth_write)
            .depth_compare_op(depth.depth_compare)
            .depth_bounds_test_enable(depth.depth_bounds_test)
            .min_depth_bounds(depth.min_depth_bounds)
            .max_depth_bounds(depth.max_depth_bounds)
            .stencil_test_enable(depth.stencil_test)
            .front(depth.front.into())
            .back(depth.back.into());
        let attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc.blend.attachments
            [..color_count]
            .iter()
            .map(|attachment| (*attachment).into())
            .collect();
        let blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(desc.blend.logic_op_enable)
            .logic_op(desc.blend.logic_op)
            .attachments(&attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .flags(vk::PipelineCreateFlags::DESCRIPTOR_BUFFER_EXT)
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&blend)
            .dynamic_state(&dynamic)
            .layout(self.pipeline_layout)
            .push_next(&mut rendering);
        let result = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        for module in modules {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
        let pipeline = result
            .map_err(|(_, err)| GalError::VkError(err))?
            .into_iter()
            .next()
            .ok_or(GalError::PipelineCreation)?;
        #[cfg(feature = "log-lifetimes")]
        trace!("Creating VkPipeline {:?}", pipeline);
        Ok(pipeline)
    }

    fn create_compute_pipeline(&mut self, stage: &ShaderBinary) -> Result<vk::Pipeline> {
        let module = self.shader_module(stage)?;
        let entry_point = CString::new(stage.entry_point.as_str()).unwrap_or_default();
        let info = vk::ComputePipelineCreateInfo::default()
            .flags(vk::PipelineCreateFlags::DESCRIPTOR_BUFFER_EXT)
            .stage(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::COMPUTE)
                    .module(module)
                    .name(&entry_point),
            )
            .layout(self.pipeline_layout);
        let result = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        unsafe { self.device.destroy_shader_module(module, None) };
        let pipeline = result
            .map_err(|(_, err)| GalError::VkError(err))?
            .into_iter()
            .next()
            .ok_or(GalError::PipelineCreation)?;
        #[cfg(feature = "log-lifetimes")]
        trace!("Creating VkPipeline {:?}", pipeline);
        Ok(pipeline)
    }

    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline) {
        #[cfg(feature = "log-lifetimes")]
        trace!("Destroying VkPipeline {:?}", pipeline);
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)?
        };
        #[cfg(feature = "log-lifetimes")]
        trace!("Creating VkFence {:?}", fence);
        Ok(fence)
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        #[cfg(feature = "log-lifetimes")]
        trace!("Destroying VkFence {:?}", fence);
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&mut self, fence: vk::Fence, timeout: u64) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout)? };
        Ok(())
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn fence_signaled(&mut self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        Ok(unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        })
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_query_pool(&mut self, kind: QueryKind, count: u32) -> Result<vk::QueryPool> {
        let info = match kind {
            QueryKind::Timestamp => vk::QueryPoolCreateInfo::default()
                .query_type(vk::QueryType::TIMESTAMP)
                .query_count(count),
            QueryKind::PipelineStatistics => vk::QueryPoolCreateInfo::default()
                .query_type(vk::QueryType::PIPELINE_STATISTICS)
                .query_count(count)
                .pipeline_statistics(crate::query::pipeline_statistics_flags()),
        };
        let pool = unsafe { self.device.create_query_pool(&info, None)? };
        unsafe { self.device.reset_query_pool(pool, 0, count) };
        self.query_pools.insert(pool, kind);
        Ok(pool)
    }

    fn destroy_query_pool(&mut self, pool: vk::QueryPool) {
        self.query_pools.remove(&pool);
        unsafe { self.device.destroy_query_pool(pool, None) };
    }

    fn reset_query_pool(&mut self, pool: vk::QueryPool, first: u32, count: u32) {
        unsafe { self.device.reset_query_pool(pool, first, count) };
    }

    fn query_results(&mut self, pool: vk::QueryPool, first: u32, count: u32) -> Result<Vec<u64>> {
        let flags = vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT;
        let kind = *self
            .query_pools
            .get(&pool)
            .ok_or(GalError::InvalidHandle)?;
        // the element type sets the per query stride
        match kind {
            QueryKind::Timestamp => {
                let mut timestamps = vec![0u64; count as usize];
                unsafe {
                    self.device
                        .get_query_pool_results(pool, first, &mut timestamps, flags)?
                };
                Ok(timestamps)
            }
            QueryKind::PipelineStatistics => {
                let mut statistics =
                    vec![[0u64; crate::query::PIPELINE_STATISTICS_COUNT]; count as usize];
                unsafe {
                    self.device
                        .get_query_pool_results(pool, first, &mut statistics, flags)?
                };
                Ok(statistics.into_iter().flatten().collect())
            }
        }
    }

    fn submit(&mut self, submission: Submission<'_>) -> Result<()> {
        self.recycle()?;
        let mut command_buffers = Vec::with_capacity(submission.streams.len());
        for commands in submission.streams.iter() {
            let command_buffer = self.command_buffer()?;
            command_buffers.push(command_buffer);
            if let Err(err) = self.encode(command_buffer, commands) {
                self.free_command_buffers.extend(command_buffers);
                return Err(err);
            }
        }
        let command_infos: Vec<vk::CommandBufferSubmitInfo> = command_buffers
            .iter()
            .map(|command_buffer| {
                vk::CommandBufferSubmitInfo::default().command_buffer(*command_buffer)
            })
            .collect();
        let waits: Vec<vk::SemaphoreSubmitInfo> = submission
            .wait
            .iter()
            .map(|(semaphore, stage)| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(*semaphore)
                    .stage_mask(*stage)
            })
            .collect();
        let signals: Vec<vk::SemaphoreSubmitInfo> = submission
            .signal
            .iter()
            .map(|semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(*semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();
        let info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_infos)
            .signal_semaphore_infos(&signals);
        unsafe {
            self.device
                .queue_submit2(self.queue, &[info], submission.fence)?
        };
        self.in_flight.push(InFlight {
            fence: submission.fence,
            command_buffers,
        });
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        self.recycle()
    }
}

impl Destructible for VulkanDevice {
    fn destroy(&mut self) {
        if let Err(err) = unsafe { self.device.device_wait_idle() } {
            warn!(?err, "Failed to wait for the device before teardown");
        }
        for (buffer, allocation) in std::mem::take(&mut self.buffers) {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free(allocation);
        }
        for (image, allocation) in std::mem::take(&mut self.images) {
            unsafe { self.device.destroy_image(image, None) };
            self.free(allocation);
        }
        unsafe {
            if self.pipeline_layout != vk::PipelineLayout::null() {
                self.device
                    .destroy_pipeline_layout(self.pipeline_layout, None);
                self.pipeline_layout = vk::PipelineLayout::null();
            }
            if self.set_layout != vk::DescriptorSetLayout::null() {
                self.device
                    .destroy_descriptor_set_layout(self.set_layout, None);
                self.set_layout = vk::DescriptorSetLayout::null();
            }
            if self.command_pool != vk::CommandPool::null() {
                #[cfg(feature = "log-lifetimes")]
                trace!("Destroying VkCommandPool {:?}", self.command_pool);
                self.device.destroy_command_pool(self.command_pool, None);
                self.command_pool = vk::CommandPool::null();
            }
        }
        self.free_command_buffers.clear();
        self.in_flight.clear();
        self.allocator = None;
    }
}

#[cfg(feature = "raii")]
impl Drop for VulkanDevice {
    fn drop(&mut self) {
        self.destroy();
    }
}
