//! The frame ring.
//!
//! Streams recorded during a frame are reconciled against each other at
//! [`FrameDriver::end_frame`], which appends the barriers every stream needs
//! to the tail of the stream submitted before it, then submits them as one
//! batch signaling the slot's fence.

use anyhow::Result;
use derivative::Derivative;
use lumen_gal::ash::vk;
use lumen_gal::command::{
    forget_states, reconcile, transition_for_present, Command, CommandStream, StreamState,
};
use lumen_gal::device::{Device, Submission};
use lumen_gal::resource::TextureHandle;
use lumen_gal::GpuContext;
use tracing::{debug, error};

use crate::config::RendererConfiguration;
use crate::frame::FrameSlot;
use crate::pool::{PooledStream, StreamPool};
use crate::profiling::{resolve_zones, GpuZone, PipelineStatistics};
use crate::swapchain::PresentSurface;

/// State of the frame currently being recorded
#[derive(Debug)]
struct OpenFrame {
    slot: usize,
    load: PooledStream,
    load_streams: Vec<PooledStream>,
    streams: Vec<PooledStream>,
    image: Option<(u32, TextureHandle)>,
}

fn assert_recording(stream: &CommandStream) {
    assert_eq!(
        stream.state(),
        StreamState::Recording,
        "Submitted stream {:?} must still be recording",
        stream.name()
    );
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct FrameDriver {
    config: RendererConfiguration,
    slots: Vec<FrameSlot>,
    pool: StreamPool,
    /// Number of frames ended so far
    frame: u64,
    open: Option<OpenFrame>,
    #[derivative(Debug = "ignore")]
    zones: Vec<GpuZone>,
    statistics: PipelineStatistics,
}

impl FrameDriver {
    pub fn new<D: Device>(ctx: &mut GpuContext<D>, config: RendererConfiguration) -> Result<Self> {
        assert!(
            config.frames_in_flight > 0,
            "The frame ring needs at least one slot"
        );
        let timestamp_queries = (config.gpu_profiling
            && ctx.capabilities().timestamps
            && config.timestamp_queries_per_frame > 0)
            .then_some(config.timestamp_queries_per_frame);
        let mut slots = Vec::with_capacity(config.frames_in_flight);
        for index in 0..config.frames_in_flight {
            match FrameSlot::new(ctx, index, timestamp_queries) {
                Ok(slot) => slots.push(slot),
                Err(err) => {
                    for mut slot in slots {
                        slot.destroy(ctx);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self {
            config,
            slots,
            pool: StreamPool::default(),
            frame: 0,
            open: None,
            zones: Vec::new(),
            statistics: PipelineStatistics::default(),
        })
    }

    pub fn config(&self) -> &RendererConfiguration {
        &self.config
    }

    /// Number of frames ended so far
    pub fn frame_index(&self) -> u64 {
        self.frame
    }

    pub fn pool(&self) -> &StreamPool {
        &self.pool
    }

    /// Zones of the most recently retired frame, outermost first
    pub fn gpu_zones(&self) -> &[GpuZone] {
        &self.zones
    }

    /// Statistics of the most recently retired frame
    pub fn pipeline_statistics(&self) -> &PipelineStatistics {
        &self.statistics
    }

    fn open_frame(&mut self) -> &mut OpenFrame {
        self.open
            .as_mut()
            .expect("No frame is being recorded, call begin_frame first")
    }

    /// Waits for the next slot of the ring and opens a frame on it
    pub fn begin_frame<D: Device>(&mut self, ctx: &mut GpuContext<D>) -> Result<()> {
        assert!(
            self.open.is_none(),
            "begin_frame called while frame {} is still being recorded",
            self.frame
        );
        let _span = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("Begin Frame"), 0));
        let index = (self.frame % self.slots.len() as u64) as usize;
        let fence = self.slots[index].fence;
        // stays signaled until the frame is submitted
        ctx.device_mut().wait_for_fence(fence, u64::MAX)?;
        self.retire_slot(ctx, index)?;

        let capacity = self.config.timestamp_queries_per_frame;
        let timestamps = self.slots[index].timestamps;
        if let Some(pool) = timestamps {
            ctx.device_mut().reset_query_pool(pool, 0, capacity);
        }
        ctx.timestamps_mut().begin_frame(timestamps, capacity);
        self.slots[index].leading.begin(ctx)?;

        let load = self.take_stream(ctx, index, "Load")?;
        self.open = Some(OpenFrame {
            slot: index,
            load,
            load_streams: Vec::new(),
            streams: Vec::new(),
            image: None,
        });
        Ok(())
    }

    /// Takes a stream from the pool, already recording.
    ///
    /// # Panics
    /// Outside of a `begin_frame`/`end_frame` pair
    pub fn acquire_stream<D: Device>(
        &mut self,
        ctx: &mut GpuContext<D>,
        name: &str,
    ) -> Result<PooledStream> {
        let slot = self.open_frame().slot;
        self.take_stream(ctx, slot, name)
    }

    fn take_stream<D: Device>(
        &mut self,
        ctx: &mut GpuContext<D>,
        current: usize,
        name: &str,
    ) -> Result<PooledStream> {
        let mut stream = match self.pool.take_free(Some(name)) {
            Some(stream) => stream,
            None => {
                self.retire_completed(ctx, current)?;
                match self.pool.take_free(Some(name)) {
                    Some(stream) => stream,
                    None => self.pool.create(Some(name)),
                }
            }
        };
        if let Err(err) = stream.begin(ctx) {
            self.pool.release(ctx, stream);
            return Err(err);
        }
        Ok(stream)
    }

    /// The driver's own load stream. Submitted first, right after the
    /// descriptor writes, so uploads recorded here precede every other stream.
    pub fn load_stream(&mut self) -> &mut CommandStream {
        &mut self.open_frame().load
    }

    /// Hands back a stream that will not be submitted
    pub fn release_stream<D: Device>(&mut self, ctx: &mut GpuContext<D>, stream: PooledStream) {
        self.pool.release(ctx, stream);
    }

    /// Queues `stream` after every stream submitted so far this frame
    ///
    /// # Panics
    /// If the stream is not recording
    pub fn submit_command_stream(&mut self, stream: PooledStream) {
        assert_recording(&stream);
        self.open_frame().streams.push(stream);
    }

    /// Queues `stream` ahead of every regular stream of the frame, so its
    /// uploads land before the draws that read them.
    ///
    /// # Panics
    /// If the stream is not recording or has an open render pass
    pub fn submit_as_load_stream(&mut self, stream: PooledStream) {
        assert_recording(&stream);
        assert!(
            !stream.is_rendering(),
            "Load stream {:?} has an open render pass",
            stream.name()
        );
        self.open_frame().load_streams.push(stream);
    }

    /// Acquires the surface's next image. `None` when the surface is not
    /// renderable, in which case the frame is submitted without presenting.
    pub fn acquire_next_image(
        &mut self,
        surface: &mut dyn PresentSurface,
    ) -> Result<Option<TextureHandle>> {
        let slot = self.open_frame().slot;
        let signal = self.slots[slot].image_available;
        let image = match surface.acquire_next_image(signal)? {
            Some(index) => match surface.images().get(index as usize) {
                Some(texture) => Some((index, *texture)),
                None => {
                    error!(index, "Surface returned an image index it does not own");
                    None
                }
            },
            None => None,
        };
        self.open_frame().image = image;
        Ok(image.map(|(_, texture)| texture))
    }

    /// Reconciles, submits and presents the open frame.
    ///
    /// When reconciliation or submission fails the frame is dropped: its
    /// streams go back to the pool unsubmitted, its descriptor writes are
    /// queued for the next frame and the slot is left ready for reuse.
    pub fn end_frame<D: Device>(
        &mut self,
        ctx: &mut GpuContext<D>,
        surface: Option<&mut dyn PresentSurface>,
    ) -> Result<()> {
        let OpenFrame {
            slot: index,
            load,
            load_streams,
            streams,
            image,
        } = self
            .open
            .take()
            .expect("end_frame called without a matching begin_frame");
        let _span = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("End Frame"), 0));

        // load stream first, then the load streams, then the rest in submission order
        let mut ordered: Vec<PooledStream> = std::iter::once(load)
            .chain(load_streams)
            .chain(streams)
            .collect();
        let mut reconciled = false;
        if let Err(err) = self.submit_frame(ctx, index, &mut ordered, image, &mut reconciled) {
            error!(?err, frame = self.frame, "Dropping frame that failed to submit");
            self.abandon_frame(ctx, index, ordered, reconciled);
            return Err(err);
        }
        ctx.confirm_descriptor_writes();

        let slot = &mut self.slots[index];
        slot.timestamps_used = ctx.timestamps_mut().used();
        ctx.timestamps_mut().begin_frame(None, 0);
        slot.retired = false;
        slot.submitted.clear();
        for stream in ordered {
            slot.submitted.push(stream.index());
            self.pool.return_submitted(stream);
        }
        let render_finished = slot.render_finished;
        self.frame += 1;

        if let (Some((index, _)), Some(surface)) = (image, surface) {
            let _span = tracy_client::Client::running()
                .map(|client| client.span(tracy_client::span_location!("Present"), 0));
            surface.present(index, render_finished)?;
        }
        if let Some(client) = tracy_client::Client::running() {
            client.frame_mark();
        }
        Ok(())
    }

    fn submit_frame<D: Device>(
        &mut self,
        ctx: &mut GpuContext<D>,
        index: usize,
        streams: &mut [PooledStream],
        image: Option<(u32, TextureHandle)>,
        reconciled: &mut bool,
    ) -> Result<()> {
        for stream in streams.iter_mut() {
            stream.try_end_rendering();
        }
        if let Some(load) = streams.first_mut() {
            ctx.flush_descriptor_writes(load)?;
        }

        let slot = &mut self.slots[index];
        let mut ordered: Vec<&mut CommandStream> =
            streams.iter_mut().map(|stream| &mut **stream).collect();

        let leading_barriers = {
            let _span = tracy_client::Client::running()
                .map(|client| client.span(tracy_client::span_location!("Reconcile"), 0));
            *reconciled = true;
            let mut leading_barriers = 0;
            for position in 0..ordered.len() {
                let (before, rest) = ordered.split_at_mut(position);
                let next = &*rest[0];
                match before.last_mut() {
                    Some(tail) => {
                        reconcile(ctx, tail, next);
                        tail.end()?;
                    }
                    None => leading_barriers = reconcile(ctx, &mut slot.leading, next),
                }
            }
            if let Some(last) = ordered.last_mut() {
                if let Some((_, texture)) = image {
                    transition_for_present(ctx, last, texture);
                }
                last.end()?;
            }
            leading_barriers
        };

        slot.leading_submitted = leading_barriers > 0;
        if slot.leading_submitted {
            slot.leading.end()?;
            slot.leading.mark_submitted(ctx);
        }
        for stream in ordered.iter_mut() {
            stream.mark_submitted(ctx);
        }

        let _span = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("Submit Frame"), 0));
        let mut commands: Vec<&[Command]> = Vec::with_capacity(ordered.len() + 1);
        if slot.leading_submitted {
            commands.push(slot.leading.commands());
        }
        commands.extend(ordered.iter().map(|stream| stream.commands()));
        let (wait, signal) = match image {
            Some(_) => (
                Some((
                    slot.image_available,
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                )),
                Some(slot.render_finished),
            ),
            None => (None, None),
        };
        // reset as late as possible, a fence left unsignaled would block the slot for good
        ctx.device_mut().reset_fence(slot.fence)?;
        ctx.device_mut().submit(Submission {
            streams: commands,
            wait,
            signal,
            fence: slot.fence,
        })
    }

    /// Hands the streams of a frame that never reached the GPU back to the pool
    fn abandon_frame<D: Device>(
        &mut self,
        ctx: &mut GpuContext<D>,
        index: usize,
        streams: Vec<PooledStream>,
        reconciled: bool,
    ) {
        if reconciled {
            let slot = &self.slots[index];
            forget_states(ctx, &slot.leading);
            for stream in streams.iter() {
                forget_states(ctx, stream);
            }
        }
        for stream in streams {
            self.pool.release(ctx, stream);
        }
        ctx.requeue_descriptor_writes();
        ctx.timestamps_mut().begin_frame(None, 0);

        let fence = self.slots[index].fence;
        let signaled = match ctx.device_mut().fence_signaled(fence) {
            Ok(signaled) => signaled,
            Err(err) => {
                error!(?err, slot = index, "Failed to query the fence of a dropped frame");
                false
            }
        };
        if !signaled {
            // reset without a submission, replace it so the next wait returns
            match ctx.device_mut().create_fence(true) {
                Ok(replacement) => {
                    ctx.device_mut().destroy_fence(fence);
                    self.slots[index].fence = replacement;
                }
                Err(err) => error!(?err, slot = index, "Failed to replace the fence of a dropped frame"),
            }
        }

        let slot = &mut self.slots[index];
        slot.leading.reset(ctx);
        slot.leading_submitted = false;
        slot.timestamps_used = 0;
        slot.retired = true;
    }

    /// Retires every other slot whose submission has already completed
    fn retire_completed<D: Device>(&mut self, ctx: &mut GpuContext<D>, current: usize) -> Result<()> {
        let count = self.slots.len();
        // oldest first, so the newest results win
        for offset in 1..count {
            let index = (current + offset) % count;
            if self.slots[index].retired {
                continue;
            }
            if ctx.device_mut().fence_signaled(self.slots[index].fence)? {
                self.retire_slot(ctx, index)?;
            }
        }
        Ok(())
    }

    /// Resolves the slot's zones and statistics and resets its streams.
    /// The slot's submission must have completed.
    fn retire_slot<D: Device>(&mut self, ctx: &mut GpuContext<D>, index: usize) -> Result<()> {
        let slot = &mut self.slots[index];
        if slot.retired {
            return Ok(());
        }

        let mut marks = Vec::new();
        let mut statistics_pools = Vec::new();
        if slot.leading_submitted {
            statistics_pools.extend(slot.leading.statistics_query());
        }
        for stream in slot
            .submitted
            .iter()
            .filter_map(|stream| self.pool.stream(*stream))
        {
            marks.extend_from_slice(stream.timestamps());
            statistics_pools.extend(stream.statistics_query());
        }

        match slot.timestamps {
            Some(pool) if slot.timestamps_used > 0 => {
                let ticks = ctx.device_mut().query_results(pool, 0, slot.timestamps_used)?;
                let period = ctx.capabilities().timestamp_period;
                self.zones = resolve_zones(&marks, &ticks, period);
            }
            _ => self.zones.clear(),
        }
        let mut statistics = PipelineStatistics::default();
        for pool in statistics_pools {
            statistics.accumulate(&ctx.device_mut().query_results(pool, 0, 1)?);
        }
        self.statistics = statistics;

        for stream in slot.submitted.drain(..) {
            self.pool.retire(ctx, stream);
        }
        slot.leading.reset(ctx);
        slot.leading_submitted = false;
        slot.timestamps_used = 0;
        slot.retired = true;

        let collected = ctx.collect_garbage();
        if collected > 0 {
            debug!(collected, slot = index, "Freed resources released by retired streams");
        }
        Ok(())
    }

    /// Drains the device and retires every slot
    pub fn wait_idle<D: Device>(&mut self, ctx: &mut GpuContext<D>) -> Result<()> {
        ctx.device_mut().wait_idle()?;
        for index in 0..self.slots.len() {
            self.retire_slot(ctx, index)?;
        }
        Ok(())
    }

    /// Waits for the device, then destroys the frame ring and every pooled stream
    pub fn destroy<D: Device>(&mut self, ctx: &mut GpuContext<D>) {
        if let Err(err) = self.wait_idle(ctx) {
            error!(?err, "Failed to drain the device before destroying the frame driver");
        }
        if let Some(open) = self.open.take() {
            for stream in std::iter::once(open.load)
                .chain(open.load_streams)
                .chain(open.streams)
            {
                self.pool.release(ctx, stream);
            }
        }
        for mut slot in self.slots.drain(..) {
            slot.destroy(ctx);
        }
        self.pool.destroy(ctx);
    }
}
