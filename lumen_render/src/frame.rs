use anyhow::Result;
use lumen_gal::ash::vk;
use lumen_gal::command::CommandStream;
use lumen_gal::device::{Device, QueryKind};
use lumen_gal::GpuContext;
#[cfg(feature = "log-lifetimes")]
use tracing::trace;

/// One entry of the frame ring
#[derive(Debug)]
pub struct FrameSlot {
    /// Signaled once the slot's submission completes
    pub fence: vk::Fence,
    /// Signaled by the surface once the acquired image may be written
    pub image_available: vk::Semaphore,
    /// Signaled by the submission, waited on by present
    pub render_finished: vk::Semaphore,
    /// Receives the barriers the first stream of the frame needs
    pub leading: CommandStream,
    pub leading_submitted: bool,
    pub timestamps: Option<vk::QueryPool>,
    pub timestamps_used: u32,
    /// Pool indices of the submitted streams, in submission order
    pub submitted: Vec<usize>,
    /// Results harvested and streams reset
    pub retired: bool,
}

impl FrameSlot {
    pub fn new<D: Device>(
        ctx: &mut GpuContext<D>,
        index: usize,
        timestamp_queries: Option<u32>,
    ) -> Result<Self> {
        let device = ctx.device_mut();
        // created signaled so the first wait on the slot returns at once
        let fence = device.create_fence(true)?;
        let image_available = device.create_semaphore()?;
        let render_finished = device.create_semaphore()?;
        let timestamps = match timestamp_queries {
            Some(count) => Some(device.create_query_pool(QueryKind::Timestamp, count)?),
            None => None,
        };
        #[cfg(feature = "log-lifetimes")]
        trace!("Creating frame slot {index}");
        Ok(Self {
            fence,
            image_available,
            render_finished,
            leading: CommandStream::new(Some(&format!("Frame {index} barriers"))),
            leading_submitted: false,
            timestamps,
            timestamps_used: 0,
            submitted: Vec::new(),
            retired: true,
        })
    }

    pub fn destroy<D: Device>(&mut self, ctx: &mut GpuContext<D>) {
        self.leading.destroy(ctx);
        let device = ctx.device_mut();
        device.destroy_fence(self.fence);
        device.destroy_semaphore(self.image_available);
        device.destroy_semaphore(self.render_finished);
        if let Some(pool) = self.timestamps.take() {
            device.destroy_query_pool(pool);
        }
    }
}
