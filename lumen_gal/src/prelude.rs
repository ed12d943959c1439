pub use crate::command::{reconcile, transition_for_present, CommandStream, StreamState};
pub use crate::descriptor::{DescriptorCapacities, DescriptorKind, DescriptorTable};
pub use crate::device::{Capabilities, Device, HeadlessDevice, MemoryLocation};
pub use crate::pipelines::{
    BlendAttachment, ComputePipelineId, GraphicsPipelineDesc, GraphicsPipelineId, StencilFace,
};
pub use crate::resource::{
    BufferCreateInfo, BufferHandle, SamplerState, TextureCreateInfo, TextureDimension,
    TextureHandle,
};
pub use crate::shader::{ShaderCompiler, ShaderDefines, ShaderId, ShaderStage};
pub use crate::traits::Destructible;
pub use crate::usage::{BufferState, BufferUsage, ShaderStages, TextureUsage, UsageState};
pub use crate::{GalError, GpuContext, GpuContextConfiguration};

#[cfg(feature = "vulkan")]
pub use crate::device::{VulkanDevice, VulkanDeviceCreateInfo};
#[cfg(feature = "shaderc")]
pub use crate::shader::ShadercCompiler;
