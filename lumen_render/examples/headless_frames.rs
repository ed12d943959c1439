//! Renders a few frames against the headless device: a compute pass writes a
//! texture, a draw samples it into the swapchain, and the resolved GPU zones
//! and pipeline statistics are logged.

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use lumen_gal::ash::vk;
use lumen_gal::shader::InMemoryShaderCompiler;
use lumen_render::prelude::*;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct DrawConstants {
    tint: [f32; 4],
    texture: u32,
    sampler: u32,
    _padding: [u32; 2],
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let compiler = InMemoryShaderCompiler::default();
    compiler
        .add_source("fullscreen", &[ShaderStage::Vertex, ShaderStage::Pixel])
        .add_source("gradient", &[ShaderStage::Compute]);
    let config = RendererConfiguration::default().with_descriptor_capacities(DescriptorCapacities {
        sampled_images: 256,
        storage_images: 256,
        storage_buffers: 256,
        samplers: 16,
    });
    let mut ctx = GpuContext::new(
        HeadlessDevice::default(),
        Box::new(compiler),
        config.context_configuration(),
    )?;
    let mut driver = FrameDriver::new(&mut ctx, config)?;
    let extent = vk::Extent2D {
        width: 1280,
        height: 720,
    };
    let mut surface = HeadlessSurface::new(&mut ctx, 3, vk::Format::B8G8R8A8_SRGB, extent);

    let gradient = ctx.create_texture(
        TextureCreateInfo::texture_2d(
            TextureUsage::SAMPLE | TextureUsage::STORAGE,
            vk::Format::R16G16B16A16_SFLOAT,
            extent.width,
            extent.height,
            1,
            false,
        )
        .with_name("Gradient"),
    )?;
    let gradient_uav = ctx.bind_texture_uav(gradient)?;
    let gradient_srv = ctx.bind_texture_srv(gradient)?;
    let sampler = ctx.sampler(&SamplerState::linear())?;

    let compute = ctx
        .compute_shader("gradient", &ShaderDefines::new())
        .ok_or_else(|| anyhow::anyhow!("gradient shader failed to compile"))?;
    let compute = ctx
        .compute_pipeline(compute)
        .ok_or_else(|| anyhow::anyhow!("gradient pipeline failed to build"))?;
    let fullscreen = ctx
        .graphics_shader("fullscreen", &ShaderDefines::new())
        .ok_or_else(|| anyhow::anyhow!("fullscreen shader failed to compile"))?;

    for frame in 0..6u32 {
        driver.begin_frame(&mut ctx)?;

        let mut stream = driver.acquire_stream(&mut ctx, "Gradient")?;
        stream.begin_zone(&mut ctx, "Gradient");
        stream.register_uav_texture(&mut ctx, gradient);
        stream.set_compute_pipeline(compute);
        stream.push_constants(&gradient_uav);
        stream.dispatch(&mut ctx, extent.width.div_ceil(8), extent.height.div_ceil(8), 1);
        stream.end_zone(&mut ctx);
        driver.submit_command_stream(stream);

        if let Some(image) = driver.acquire_next_image(&mut surface)? {
            let mut stream = driver.acquire_stream(&mut ctx, "Composite")?;
            stream.begin_zone(&mut ctx, "Composite");
            stream.register_srv_texture(&mut ctx, gradient);
            stream.set_render_target_clear(0, image, [0.0, 0.0, 0.0, 1.0]);
            let mut desc = GraphicsPipelineDesc::default()
                .with_shader(fullscreen)
                .disable_depth_test();
            stream.propagate_rendering_info(&ctx, &mut desc);
            if let Some(pipeline) = ctx.graphics_pipeline(&desc) {
                let phase = frame as f32 / 6.0;
                let tint = glam::Vec4::new(1.0, phase, 1.0 - phase, 1.0);
                stream.set_graphics_pipeline(pipeline);
                stream.push_constants(&DrawConstants {
                    tint: tint.to_array(),
                    texture: gradient_srv,
                    sampler,
                    _padding: [0; 2],
                });
                stream.draw(&mut ctx, 3, 1, 0, 0);
            }
            stream.end_zone(&mut ctx);
            driver.submit_command_stream(stream);
        }

        driver.end_frame(&mut ctx, Some(&mut surface))?;

        for zone in driver.gpu_zones() {
            info!(frame, zone = %zone.name, depth = zone.depth, ms = zone.ms, "GPU zone");
        }
        for (name, value) in driver.pipeline_statistics().iter() {
            info!(frame, value, "{name}");
        }
    }

    driver.destroy(&mut ctx);
    surface.destroy(&mut ctx);
    ctx.destroy();
    info!(live_objects = ctx.device().live_objects(), "Shut down");
    Ok(())
}
