use anyhow::Result;
use ash::vk;
use bytemuck::Pod;

use super::barrier::mip_barrier;
use super::{BlitInfo, Command, CommandStream};
use crate::device::{Device, MemoryLocation, RawBufferInfo};
use crate::resource::texture::texel_size;
use crate::resource::{BufferHandle, TextureHandle};
use crate::usage::{BufferState, BufferUsage, TextureUsage};
use crate::GpuContext;

impl CommandStream {
    /// Host visible scratch buffer holding `data`, freed when the stream resets
    fn stage<D: Device>(&mut self, ctx: &mut GpuContext<D>, data: &[u8]) -> Result<vk::Buffer> {
        let staging = ctx.device.create_buffer(&RawBufferInfo {
            size: data.len() as u64,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
            name: Some("Upload staging"),
        })?;
        self.keep_staging(staging);
        ctx.device.write_buffer(staging, 0, data)?;
        Ok(staging)
    }

    pub fn copy_to_buffer<D: Device, T: Pod>(
        &mut self,
        ctx: &mut GpuContext<D>,
        dst: BufferHandle,
        offset: u64,
        data: &[T],
    ) -> Result<()> {
        self.assert_recording();
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.is_empty() {
            return Ok(());
        }
        let size = ctx.resources.buffer(dst).size();
        assert!(
            offset + bytes.len() as u64 <= size,
            "Copy of {} bytes at offset {offset} overruns a buffer of {size} bytes",
            bytes.len()
        );
        let staging = self.stage(ctx, bytes)?;
        self.use_buffer(ctx, dst, BufferState::transfer(BufferUsage::TRANSFER_DST));
        self.record(Command::CopyBuffer {
            src: staging,
            dst: ctx.resources.buffer(dst).handle(),
            regions: vec![vk::BufferCopy {
                src_offset: 0,
                dst_offset: offset,
                size: bytes.len() as u64,
            }],
        });
        Ok(())
    }

    /// Uploads tightly packed texels into mip 0 of every layer.
    ///
    /// # Panics
    /// If `data` is larger than mip 0 of every layer, for formats with a known texel size
    pub fn copy_to_texture<D: Device>(
        &mut self,
        ctx: &mut GpuContext<D>,
        dst: TextureHandle,
        data: &[u8],
    ) -> Result<()> {
        self.assert_recording();
        if data.is_empty() {
            return Ok(());
        }
        let texture = ctx.resources.texture(dst);
        if let Some(texel) = texel_size(texture.format()) {
            let extent = texture.extent();
            let size = texel * extent.width as u64 * extent.height as u64 * texture.layers() as u64;
            assert!(
                data.len() as u64 <= size,
                "Copy of {} bytes overruns mip 0 of texture {:?} holding {size} bytes",
                data.len(),
                texture.name()
            );
        }
        let staging = self.stage(ctx, data)?;
        self.use_texture(ctx, dst, TextureUsage::TRANSFER_DST);
        let texture = ctx.resources.texture(dst);
        let extent = texture.extent();
        self.record(Command::CopyBufferToImage {
            src: staging,
            dst: texture.image(),
            layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            region: vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: texture.aspect(),
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: texture.layers(),
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
            },
        });
        Ok(())
    }

    /// Fills mips 1.. by successive blits from mip 0.
    ///
    /// The whole chain is left in TRANSFER_DST so the tracked usage holds.
    ///
    /// # Panics
    /// Unless the texture was declared with both TRANSFER_SRC and TRANSFER_DST
    pub fn generate_mipmaps<D: Device>(&mut self, ctx: &mut GpuContext<D>, texture: TextureHandle) {
        self.assert_recording();
        let usage = ctx.resources.texture(texture).usage();
        assert!(
            usage.contains(TextureUsage::TRANSFER_SRC | TextureUsage::TRANSFER_DST),
            "Texture {:?} needs TRANSFER_SRC and TRANSFER_DST to generate mips, declared {:?}",
            ctx.resources.texture(texture).name(),
            usage
        );
        self.use_texture(ctx, texture, TextureUsage::TRANSFER_DST);
        let tex = ctx.resources.texture(texture);
        let mips = tex.mips();
        if mips < 2 {
            return;
        }
        let extent = tex.extent();
        let level_extent = |mip: u32| vk::Extent3D {
            width: (extent.width >> mip).max(1),
            height: (extent.height >> mip).max(1),
            depth: 1,
        };

        let mut commands = Vec::with_capacity(mips as usize * 2);
        for mip in 0..mips - 1 {
            commands.push(Command::ImageBarrier(mip_barrier(
                tex,
                TextureUsage::TRANSFER_DST,
                TextureUsage::TRANSFER_SRC,
                mip,
                1,
            )));
            commands.push(Command::BlitImage(BlitInfo {
                image: tex.image(),
                aspect: tex.aspect(),
                src_mip: mip,
                src_extent: level_extent(mip),
                dst_mip: mip + 1,
                dst_extent: level_extent(mip + 1),
                layer_count: tex.layers(),
            }));
        }
        commands.push(Command::ImageBarrier(mip_barrier(
            tex,
            TextureUsage::TRANSFER_SRC,
            TextureUsage::TRANSFER_DST,
            0,
            mips - 1,
        )));
        for command in commands {
            self.record_barrier_or_op(command);
        }
    }

    fn record_barrier_or_op(&mut self, command: Command) {
        if command.is_barrier() {
            self.record_barrier(command);
        } else {
            self.record(command);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{headless_context, submit};
    use crate::resource::{BufferCreateInfo, TextureCreateInfo};

    #[test]
    fn test_copy_to_buffer_lands_on_submit() {
        let mut ctx = headless_context();
        let buffer = ctx
            .create_buffer(BufferCreateInfo::structured(64, false))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream
            .copy_to_buffer(&mut ctx, buffer, 16, &[1u32, 2, 3, 4])
            .unwrap();
        assert_eq!(
            stream.buffer_touch(buffer).unwrap().last.usage,
            BufferUsage::TRANSFER_DST
        );
        submit(&mut ctx, &mut [&mut stream]);

        let raw = ctx.buffer(buffer).handle();
        let bytes = ctx.device().read_buffer(raw).unwrap();
        let expected: &[u8] = bytemuck::cast_slice(&[1u32, 2, 3, 4]);
        assert_eq!(&bytes[16..32], expected);

        let buffers = ctx.device().live_buffers();
        stream.reset(&mut ctx);
        assert_eq!(ctx.device().live_buffers(), buffers - 1);
    }

    #[test]
    #[should_panic(expected = "overruns")]
    fn test_copy_past_the_end_panics() {
        let mut ctx = headless_context();
        let buffer = ctx
            .create_buffer(BufferCreateInfo::structured(8, false))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        let _ = stream.copy_to_buffer(&mut ctx, buffer, 4, &[0u32; 2]);
    }

    #[test]
    #[should_panic(expected = "overruns mip 0")]
    fn test_texture_copy_past_the_end_panics() {
        let mut ctx = headless_context();
        let texture = ctx
            .create_texture(TextureCreateInfo::texture_2d(
                TextureUsage::SAMPLE | TextureUsage::TRANSFER_DST,
                vk::Format::R8G8B8A8_UNORM,
                4,
                4,
                1,
                false,
            ))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        let _ = stream.copy_to_texture(&mut ctx, texture, &[0; 4 * 4 * 4 + 1]);
    }

    #[test]
    #[should_panic(expected = "needs TRANSFER_SRC and TRANSFER_DST")]
    fn test_mipmaps_without_transfer_src_panic() {
        let mut ctx = headless_context();
        let texture = ctx
            .create_texture(TextureCreateInfo::texture_2d(
                TextureUsage::SAMPLE | TextureUsage::TRANSFER_DST,
                vk::Format::R8G8B8A8_UNORM,
                8,
                8,
                1,
                true,
            ))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.generate_mipmaps(&mut ctx, texture);
    }

    #[test]
    fn test_generate_mipmaps_walks_the_chain() {
        let mut ctx = headless_context();
        let texture = ctx
            .create_texture(TextureCreateInfo::texture_2d(
                TextureUsage::SAMPLE | TextureUsage::TRANSFER_SRC | TextureUsage::TRANSFER_DST,
                vk::Format::R8G8B8A8_UNORM,
                8,
                8,
                1,
                true,
            ))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream
            .copy_to_texture(&mut ctx, texture, &[255; 8 * 8 * 4])
            .unwrap();
        stream.generate_mipmaps(&mut ctx, texture);

        let blits: Vec<(u32, u32)> = stream
            .commands()
            .iter()
            .filter_map(|command| match command {
                Command::BlitImage(blit) => Some((blit.src_mip, blit.dst_extent.width)),
                _ => None,
            })
            .collect();
        assert_eq!(blits, vec![(0, 4), (1, 2), (2, 1)]);

        let Some(Command::ImageBarrier(last)) = stream.commands().last() else {
            panic!("expected the chain to be transitioned back");
        };
        assert_eq!(last.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(last.mip_count, 3);
        assert_eq!(
            stream.texture_touch(texture).unwrap().last,
            TextureUsage::TRANSFER_DST
        );
        stream.destroy(&mut ctx);
    }
}
