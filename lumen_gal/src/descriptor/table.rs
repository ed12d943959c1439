use std::collections::BTreeMap;

use anyhow::Result;
use ash::vk;
use lumen_containers::prelude::IndexFreeList;

use super::{DescriptorCapacities, DescriptorHeapLayout, DescriptorKind};
use crate::command::{BufferBarrier, Command, CommandStream};
use crate::device::{Device, MemoryLocation, RawBufferInfo};

/// Single GPU visible table of bindless descriptors.
///
/// Slot 0 of every kind is never handed out and stays zeroed, so an unbound
/// index reads an empty descriptor. Writes are queued on the CPU and flushed
/// into a load stream through one staging copy. Queued writes are keyed by
/// slot offset, the last write to a slot wins, so copy regions never overlap.
#[derive(Debug)]
pub struct DescriptorTable {
    buffer: vk::Buffer,
    layout: DescriptorHeapLayout,
    slots: [IndexFreeList; 4],
    pending: BTreeMap<u64, Vec<u8>>,
    /// Recorded into a stream that was not confirmed submitted yet
    flushed: BTreeMap<u64, Vec<u8>>,
    cleared: bool,
    clear_unsubmitted: bool,
}

impl DescriptorTable {
    pub fn new<D: Device>(device: &mut D, capacities: &DescriptorCapacities) -> Result<Self> {
        let layout = device.descriptor_heap_layout(capacities)?;
        let buffer = device.create_buffer(&RawBufferInfo {
            size: layout.size,
            usage: vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT
                | vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::GpuOnly,
            name: Some("Descriptor table"),
        })?;
        let slots = DescriptorKind::ALL.map(|kind| IndexFreeList::new(1, layout.range(kind).capacity));
        Ok(Self {
            buffer,
            layout,
            slots,
            pending: BTreeMap::new(),
            flushed: BTreeMap::new(),
            cleared: false,
            clear_unsubmitted: false,
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn layout(&self) -> &DescriptorHeapLayout {
        &self.layout
    }

    /// Byte offset of a slot inside the table
    pub fn slot_offset(&self, kind: DescriptorKind, slot: u32) -> u64 {
        let range = self.layout.range(kind);
        range.offset + slot as u64 * range.stride
    }

    /// Takes a free slot of `kind` and queues `bytes` to be written into it.
    ///
    /// # Panics
    /// When every slot of `kind` is in use. Capacities are fixed at startup.
    pub fn acquire(&mut self, kind: DescriptorKind, bytes: Vec<u8>) -> u32 {
        let slot = self.slots[kind.index()].allocate().unwrap_or_else(|| {
            panic!(
                "Descriptor table exhausted all {} {:?} slots",
                self.layout.range(kind).capacity,
                kind
            )
        });
        self.queue_write(kind, slot, bytes);
        slot
    }

    /// Returns a slot to the pool and zeroes its descriptor
    pub fn release(&mut self, kind: DescriptorKind, slot: u32) {
        let range = self.layout.range(kind);
        assert!(
            slot != 0 && slot < range.capacity,
            "Released {kind:?} slot {slot} is outside 1..{}",
            range.capacity
        );
        self.queue_write(kind, slot, vec![0; range.stride as usize]);
        self.slots[kind.index()].free(slot);
    }

    fn queue_write(&mut self, kind: DescriptorKind, slot: u32, mut bytes: Vec<u8>) {
        let stride = self.layout.range(kind).stride;
        assert!(
            bytes.len() as u64 <= stride,
            "{kind:?} descriptor of {} bytes does not fit its slot",
            bytes.len()
        );
        // whole slot, so a replaced write leaves nothing of the previous descriptor
        bytes.resize(stride as usize, 0);
        self.pending.insert(self.slot_offset(kind, slot), bytes);
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    pub fn allocated(&self, kind: DescriptorKind) -> u32 {
        self.slots[kind.index()].allocated()
    }

    /// Records every queued write into `stream`.
    ///
    /// The first flush also zero-fills the whole table.
    pub fn flush<D: Device>(&mut self, device: &mut D, stream: &mut CommandStream) -> Result<()> {
        if self.cleared && self.pending.is_empty() {
            return Ok(());
        }
        let shader_stages = device.capabilities().shader_stage_mask();
        let buffer = self.buffer;
        let whole = |src_stage, src_access, dst_stage, dst_access| {
            Command::BufferBarrier(BufferBarrier {
                buffer,
                src_stage,
                src_access,
                dst_stage,
                dst_access,
                offset: 0,
                size: vk::WHOLE_SIZE,
            })
        };
        stream.record(whole(
            shader_stages | vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ));
        if !self.cleared {
            stream.record(Command::FillBuffer {
                buffer: self.buffer,
                offset: 0,
                size: vk::WHOLE_SIZE,
                data: 0,
            });
            stream.record(whole(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            ));
            self.cleared = true;
            self.clear_unsubmitted = true;
        }

        if !self.pending.is_empty() {
            let total: u64 = self.pending.values().map(|bytes| bytes.len() as u64).sum();
            let staging = device.create_buffer(&RawBufferInfo {
                size: total,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
                name: Some("Descriptor staging"),
            })?;
            stream.keep_staging(staging);

            let mut regions = Vec::with_capacity(self.pending.len());
            let mut src_offset = 0;
            for (dst_offset, bytes) in self.pending.iter() {
                device.write_buffer(staging, src_offset, bytes)?;
                regions.push(vk::BufferCopy {
                    src_offset,
                    dst_offset: *dst_offset,
                    size: bytes.len() as u64,
                });
                src_offset += bytes.len() as u64;
            }
            self.flushed.append(&mut self.pending);
            stream.record(Command::CopyBuffer {
                src: staging,
                dst: self.buffer,
                regions,
            });
        }

        stream.record(whole(
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
            shader_stages | vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        ));
        Ok(())
    }

    /// Drops the record of flushed writes once their stream was submitted
    pub fn confirm_flushed(&mut self) {
        self.flushed.clear();
        self.clear_unsubmitted = false;
    }

    /// Queues the writes flushed since the last [`Self::confirm_flushed`]
    /// again, for when their stream is discarded without being submitted.
    /// Writes queued since then take precedence.
    pub fn requeue_flushed(&mut self) {
        for (offset, bytes) in std::mem::take(&mut self.flushed) {
            self.pending.entry(offset).or_insert(bytes);
        }
        if self.clear_unsubmitted {
            self.cleared = false;
            self.clear_unsubmitted = false;
        }
    }

    pub fn destroy<D: Device>(&mut self, device: &mut D) {
        self.pending.clear();
        self.flushed.clear();
        if self.buffer != vk::Buffer::null() {
            device.destroy_buffer(self.buffer);
            self.buffer = vk::Buffer::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{headless_context, submit};

    #[test]
    fn test_slot_zero_is_reserved() {
        let mut ctx = headless_context();
        let slot = ctx.descriptors.acquire(DescriptorKind::Sampler, vec![1; 16]);
        assert_eq!(slot, 1);
    }

    #[test]
    fn test_released_slot_is_reused() {
        let mut ctx = headless_context();
        let a = ctx.descriptors.acquire(DescriptorKind::StorageBuffer, vec![1; 16]);
        ctx.descriptors.release(DescriptorKind::StorageBuffer, a);
        let b = ctx.descriptors.acquire(DescriptorKind::StorageBuffer, vec![2; 16]);
        assert_eq!(a, b);
        assert_eq!(ctx.descriptors.allocated(DescriptorKind::StorageBuffer), 1);
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn test_exhausting_capacity_panics() {
        let mut ctx = headless_context();
        let capacity = ctx.descriptors.layout().range(DescriptorKind::Sampler).capacity;
        for _ in 0..capacity {
            ctx.descriptors.acquire(DescriptorKind::Sampler, vec![1; 16]);
        }
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_releasing_reserved_slot_panics() {
        let mut ctx = headless_context();
        ctx.descriptors.release(DescriptorKind::Sampler, 0);
    }

    #[test]
    fn test_flush_writes_and_release_zeroes() {
        let mut ctx = headless_context();
        let slot = ctx.descriptors.acquire(DescriptorKind::StorageBuffer, vec![7; 16]);
        let offset = ctx.descriptors.slot_offset(DescriptorKind::StorageBuffer, slot) as usize;

        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        ctx.flush_descriptor_writes(&mut stream).unwrap();
        assert_eq!(ctx.descriptors.pending_writes(), 0);
        submit(&mut ctx, &mut [&mut stream]);

        let table = ctx.descriptors.buffer();
        let bytes = ctx.device().read_buffer(table).unwrap();
        assert_eq!(&bytes[offset..offset + 16], &[7; 16]);
        assert!(bytes[..offset].iter().all(|byte| *byte == 0));

        ctx.descriptors.release(DescriptorKind::StorageBuffer, slot);
        stream.reset(&mut ctx);
        stream.begin(&mut ctx).unwrap();
        ctx.flush_descriptor_writes(&mut stream).unwrap();
        submit(&mut ctx, &mut [&mut stream]);

        let bytes = ctx.device().read_buffer(table).unwrap();
        assert_eq!(&bytes[offset..offset + 16], &[0; 16]);
    }

    #[test]
    fn test_first_flush_clears_table() {
        let mut ctx = headless_context();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        ctx.flush_descriptor_writes(&mut stream).unwrap();
        let fills = stream
            .commands()
            .iter()
            .filter(|command| matches!(command, Command::FillBuffer { .. }))
            .count();
        assert_eq!(fills, 1);

        // nothing queued and already cleared: the second flush records nothing
        let recorded = stream.commands().len();
        ctx.flush_descriptor_writes(&mut stream).unwrap();
        assert_eq!(stream.commands().len(), recorded);
        stream.end().unwrap();
        stream.reset(&mut ctx);
    }

    #[test]
    fn test_rewritten_slot_is_copied_once_with_last_bytes() {
        let mut ctx = headless_context();
        let kind = DescriptorKind::StorageBuffer;
        let first = ctx.descriptors.acquire(kind, vec![1; 16]);
        ctx.descriptors.release(kind, first);
        let second = ctx.descriptors.acquire(kind, vec![2; 16]);
        assert_eq!(first, second);
        assert_eq!(ctx.descriptors.pending_writes(), 1);
        let offset = ctx.descriptors.slot_offset(kind, second) as usize;
        let stride = ctx.descriptors.layout().range(kind).stride as usize;

        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        ctx.flush_descriptor_writes(&mut stream).unwrap();
        let regions: Vec<&vk::BufferCopy> = stream
            .commands()
            .iter()
            .filter_map(|command| match command {
                Command::CopyBuffer { regions, .. } => Some(regions.iter()),
                _ => None,
            })
            .flatten()
            .collect();
        let mut destinations: Vec<u64> = regions.iter().map(|region| region.dst_offset).collect();
        destinations.sort_unstable();
        destinations.dedup();
        assert_eq!(destinations.len(), regions.len());
        submit(&mut ctx, &mut [&mut stream]);

        let bytes = ctx.device().read_buffer(ctx.descriptors.buffer()).unwrap();
        assert_eq!(&bytes[offset..offset + 16], &[2; 16]);
        assert!(bytes[offset + 16..offset + stride].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn test_requeued_writes_survive_a_discarded_stream() {
        let mut ctx = headless_context();
        let kind = DescriptorKind::StorageBuffer;
        let lost = ctx.descriptors.acquire(kind, vec![3; 16]);
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        ctx.flush_descriptor_writes(&mut stream).unwrap();
        assert_eq!(ctx.descriptors.pending_writes(), 0);
        stream.reset(&mut ctx);

        // queued after the failed flush, must not be overwritten by the requeue
        ctx.descriptors.release(kind, lost);
        ctx.descriptors.requeue_flushed();
        assert_eq!(ctx.descriptors.pending_writes(), 1);

        stream.begin(&mut ctx).unwrap();
        ctx.flush_descriptor_writes(&mut stream).unwrap();
        let fills = stream
            .commands()
            .iter()
            .filter(|command| matches!(command, Command::FillBuffer { .. }))
            .count();
        assert_eq!(fills, 1);
        submit(&mut ctx, &mut [&mut stream]);
        ctx.descriptors.confirm_flushed();

        let offset = ctx.descriptors.slot_offset(kind, lost) as usize;
        let bytes = ctx.device().read_buffer(ctx.descriptors.buffer()).unwrap();
        assert_eq!(&bytes[offset..offset + 16], &[0; 16]);
    }
}
