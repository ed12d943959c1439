//! Frame ring, stream pooling and presentation on top of [`lumen_gal`].
//!
//! Content code records into streams handed out by the [`FrameDriver`] and
//! never touches barriers or frame slots.

pub mod config;
pub mod driver;
pub mod frame;
pub mod pool;
pub mod profiling;
pub mod swapchain;

pub use config::RendererConfiguration;
pub use driver::FrameDriver;
pub use pool::{PooledStream, StreamPool};
pub use profiling::{GpuZone, PipelineStatistics};
pub use swapchain::{HeadlessSurface, PresentSurface};

pub mod prelude {
    pub use crate::{
        FrameDriver, GpuZone, HeadlessSurface, PipelineStatistics, PooledStream, PresentSurface,
        RendererConfiguration,
    };
    pub use lumen_gal::prelude::*;
}

#[cfg(test)]
pub(crate) mod testing {
    use lumen_gal::descriptor::DescriptorCapacities;
    use lumen_gal::device::HeadlessDevice;
    use lumen_gal::shader::{InMemoryShaderCompiler, ShaderStage};
    use lumen_gal::GpuContext;

    use crate::RendererConfiguration;

    pub(crate) type TestContext = GpuContext<HeadlessDevice>;

    pub(crate) fn headless_context() -> TestContext {
        let compiler = InMemoryShaderCompiler::default();
        compiler
            .add_source("triangle", &[ShaderStage::Vertex, ShaderStage::Pixel])
            .add_source("cull", &[ShaderStage::Compute]);
        let config = RendererConfiguration::default().with_descriptor_capacities(
            DescriptorCapacities {
                sampled_images: 64,
                storage_images: 64,
                storage_buffers: 64,
                samplers: 16,
            },
        );
        GpuContext::new(
            HeadlessDevice::default(),
            Box::new(compiler),
            config.context_configuration(),
        )
        .unwrap()
    }
}
