use anyhow::Result;
use lumen_gal::ash::vk;
use lumen_gal::device::{Device, HeadlessDevice};
use lumen_gal::resource::TextureHandle;
use lumen_gal::usage::TextureUsage;
use lumen_gal::GpuContext;

/// Presentation engine the driver renders into
pub trait PresentSurface {
    /// Index of the next image, signaling `signal` once it may be written.
    /// `None` when the surface is not renderable, e.g. minimized or out of date.
    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Result<Option<u32>>;

    /// Queues `index` for presentation once `wait` is signaled
    fn present(&mut self, index: u32, wait: vk::Semaphore) -> Result<()>;

    /// Swapchain images, imported into the context
    fn images(&self) -> &[TextureHandle];

    fn format(&self) -> vk::Format;

    fn extent(&self) -> vk::Extent2D;
}

/// Round-robin surface over images of a [`HeadlessDevice`]
#[derive(Debug)]
pub struct HeadlessSurface {
    images: Vec<TextureHandle>,
    raw: Vec<vk::Image>,
    format: vk::Format,
    extent: vk::Extent2D,
    next: u32,
    renderable: bool,
    presented: Vec<u32>,
}

impl HeadlessSurface {
    pub fn new(
        ctx: &mut GpuContext<HeadlessDevice>,
        image_count: u32,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Self {
        let mut images = Vec::with_capacity(image_count as usize);
        let mut raw = Vec::with_capacity(image_count as usize);
        for index in 0..image_count {
            let image = ctx.device_mut().create_external_image();
            let name = format!("Swapchain image {index}");
            images.push(ctx.import_texture(
                image,
                format,
                extent,
                TextureUsage::COLOR_TARGET | TextureUsage::TRANSFER_DST,
                Some(&name),
            ));
            raw.push(image);
        }
        Self {
            images,
            raw,
            format,
            extent,
            next: 0,
            renderable: true,
            presented: Vec::new(),
        }
    }

    /// Simulates a minimized window
    pub fn set_renderable(&mut self, renderable: bool) {
        self.renderable = renderable;
    }

    /// Image indices in the order they were presented
    pub fn presented(&self) -> &[u32] {
        &self.presented
    }

    pub fn destroy(&mut self, ctx: &mut GpuContext<HeadlessDevice>) {
        for texture in self.images.drain(..) {
            ctx.destroy_texture(texture);
        }
        for image in self.raw.drain(..) {
            ctx.device_mut().destroy_image(image);
        }
    }
}

impl PresentSurface for HeadlessSurface {
    fn acquire_next_image(&mut self, _signal: vk::Semaphore) -> Result<Option<u32>> {
        if !self.renderable || self.images.is_empty() {
            return Ok(None);
        }
        let index = self.next;
        self.next = (self.next + 1) % self.images.len() as u32;
        Ok(Some(index))
    }

    fn present(&mut self, index: u32, _wait: vk::Semaphore) -> Result<()> {
        self.presented.push(index);
        Ok(())
    }

    fn images(&self) -> &[TextureHandle] {
        &self.images
    }

    fn format(&self) -> vk::Format {
        self.format
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}
