use ash::vk;
use tracing::error;

use super::{AttachmentClear, AttachmentInfo, Command, CommandStream, RenderingInfo};
use crate::device::Device;
use crate::pipelines::GraphicsPipelineDesc;
use crate::resource::TextureHandle;
use crate::usage::{texture_layout, TextureUsage};
use crate::GpuContext;

pub const MAX_COLOR_TARGETS: usize = 8;

#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum LoadAction {
    Preserve,
    Discard,
    Clear(AttachmentClear),
}

impl LoadAction {
    fn preserve(preserve: bool) -> Self {
        if preserve {
            LoadAction::Preserve
        } else {
            LoadAction::Discard
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct TargetBinding {
    pub texture: TextureHandle,
    pub layer: u32,
    pub load: LoadAction,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct PassState {
    pub color: [Option<TargetBinding>; MAX_COLOR_TARGETS],
    pub depth: Option<TargetBinding>,
    pub active: bool,
    pub area: vk::Rect2D,
}

impl PassState {
    pub fn has_attachments(&self) -> bool {
        self.depth.is_some() || self.color.iter().any(Option::is_some)
    }

    fn color_count(&self) -> usize {
        self.color
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |last| last + 1)
    }
}

impl CommandStream {
    fn bind_target(&mut self, slot: Option<usize>, binding: TargetBinding) {
        self.assert_recording();
        if self.pass.active {
            error!(
                stream = ?self.name(),
                ?slot,
                "Render targets cannot change while a render pass is open"
            );
            return;
        }
        match slot {
            Some(slot) => {
                assert!(
                    slot < MAX_COLOR_TARGETS,
                    "Color target slot {slot} exceeds the {MAX_COLOR_TARGETS} supported targets"
                );
                self.pass.color[slot] = Some(binding);
            }
            None => self.pass.depth = Some(binding),
        }
    }

    pub fn set_render_target(&mut self, slot: usize, texture: TextureHandle, preserve: bool) {
        self.bind_target(
            Some(slot),
            TargetBinding {
                texture,
                layer: 0,
                load: LoadAction::preserve(preserve),
            },
        );
    }

    pub fn set_render_target_clear(&mut self, slot: usize, texture: TextureHandle, color: [f32; 4]) {
        self.bind_target(
            Some(slot),
            TargetBinding {
                texture,
                layer: 0,
                load: LoadAction::Clear(AttachmentClear::Color(color)),
            },
        );
    }

    pub fn set_render_target_layer(
        &mut self,
        slot: usize,
        layer: u32,
        texture: TextureHandle,
        preserve: bool,
    ) {
        self.bind_target(
            Some(slot),
            TargetBinding {
                texture,
                layer,
                load: LoadAction::preserve(preserve),
            },
        );
    }

    pub fn set_depth_target(&mut self, texture: TextureHandle, preserve: bool) {
        self.bind_target(
            None,
            TargetBinding {
                texture,
                layer: 0,
                load: LoadAction::preserve(preserve),
            },
        );
    }

    pub fn set_depth_target_clear(&mut self, texture: TextureHandle, depth: f32, stencil: u32) {
        self.bind_target(
            None,
            TargetBinding {
                texture,
                layer: 0,
                load: LoadAction::Clear(AttachmentClear::DepthStencil { depth, stencil }),
            },
        );
    }

    fn attachment<D: Device>(
        &mut self,
        ctx: &mut GpuContext<D>,
        binding: TargetBinding,
        usage: TextureUsage,
        area: &mut Option<vk::Extent2D>,
    ) -> Option<AttachmentInfo> {
        self.use_texture(ctx, binding.texture, usage);
        let texture = ctx.resources.texture_mut(binding.texture);
        let extent = texture.extent();
        match *area {
            None => *area = Some(extent),
            Some(expected) if expected != extent => error!(
                stream = ?self.name(),
                ?expected,
                found = ?extent,
                "Render target dimensions do not match the render area"
            ),
            Some(_) => {}
        }
        let key = texture.target_view_key(binding.layer);
        let view = match texture.view(&mut ctx.device, key) {
            Ok(view) => view,
            Err(err) => {
                error!(?err, "Failed to create render target view");
                return None;
            }
        };
        let (load_op, clear) = match binding.load {
            LoadAction::Preserve => (vk::AttachmentLoadOp::LOAD, None),
            LoadAction::Discard => (vk::AttachmentLoadOp::DONT_CARE, None),
            LoadAction::Clear(clear) => (vk::AttachmentLoadOp::CLEAR, Some(clear)),
        };
        Some(AttachmentInfo {
            view,
            layout: texture_layout(usage),
            load_op,
            store_op: vk::AttachmentStoreOp::STORE,
            clear,
        })
    }

    /// Starts dynamic rendering into the bound targets.
    ///
    /// Draws begin the pass on their own, calling this is only needed for
    /// passes that clear without drawing.
    pub fn begin_render_pass<D: Device>(&mut self, ctx: &mut GpuContext<D>) {
        self.assert_recording();
        if self.pass.active {
            return;
        }
        if !self.pass.has_attachments() {
            error!(stream = ?self.name(), "Render pass begun without any render target");
            return;
        }

        let mut area = None;
        let mut color = Vec::with_capacity(self.pass.color_count());
        for slot in 0..self.pass.color_count() {
            let info = match self.pass.color[slot] {
                Some(binding) => {
                    match self.attachment(ctx, binding, TextureUsage::COLOR_TARGET, &mut area) {
                        Some(info) => info,
                        None => return,
                    }
                }
                None => AttachmentInfo {
                    view: vk::ImageView::null(),
                    layout: vk::ImageLayout::UNDEFINED,
                    load_op: vk::AttachmentLoadOp::DONT_CARE,
                    store_op: vk::AttachmentStoreOp::DONT_CARE,
                    clear: None,
                },
            };
            color.push(info);
        }
        let depth = match self.pass.depth {
            Some(binding) => {
                match self.attachment(ctx, binding, TextureUsage::DEPTH_TARGET, &mut area) {
                    Some(info) => Some(info),
                    None => return,
                }
            }
            None => None,
        };

        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: area.unwrap_or_default(),
        };
        self.record(Command::BeginRendering(RenderingInfo {
            area,
            layer_count: 1,
            color,
            depth,
        }));
        self.pass.active = true;
        self.pass.area = area;
        self.bindings.viewport_dirty = true;
        self.bindings.scissor_dirty = true;
    }

    /// Closes the pass and unbinds every render target
    pub fn end_render_pass(&mut self) {
        self.assert_recording();
        self.try_end_rendering();
        self.pass.color = Default::default();
        self.pass.depth = None;
    }

    /// Closes the pass if one is open, keeping the bound targets
    pub fn try_end_rendering(&mut self) {
        if self.pass.active {
            self.record(Command::EndRendering);
            self.pass.active = false;
        }
    }

    pub fn is_rendering(&self) -> bool {
        self.pass.active
    }

    /// Copies the formats of the bound targets into `desc`
    pub fn propagate_rendering_info<D: Device>(
        &self,
        ctx: &GpuContext<D>,
        desc: &mut GraphicsPipelineDesc,
    ) {
        let formats = &mut desc.rendering;
        formats.color_formats = [vk::Format::UNDEFINED; MAX_COLOR_TARGETS];
        for (slot, binding) in self.pass.color.iter().enumerate() {
            if let Some(binding) = binding {
                formats.color_formats[slot] = ctx.resources.texture(binding.texture).format();
            }
        }
        formats.color_count = self.pass.color_count() as u32;
        formats.depth_format = self
            .pass
            .depth
            .map_or(vk::Format::UNDEFINED, |binding| {
                ctx.resources.texture(binding.texture).format()
            });
    }
}

#[cfg(test)]
mod tests {
    use crate::command::{Command, CommandStream};
    use crate::context::testing::headless_context;
    use crate::pipelines::GraphicsPipelineDesc;
    use crate::resource::TextureCreateInfo;
    use crate::usage::TextureUsage;
    use ash::vk;

    fn target(ctx: &mut crate::context::testing::TestContext, size: u32, format: vk::Format, usage: TextureUsage) -> crate::resource::TextureHandle {
        ctx.create_texture(TextureCreateInfo::texture_2d(usage, format, size, size, 1, false))
            .unwrap()
    }

    #[test]
    fn test_draw_begins_pass_lazily() {
        let mut ctx = headless_context();
        let color = target(&mut ctx, 64, vk::Format::R8G8B8A8_UNORM, TextureUsage::COLOR_TARGET);
        let depth = target(&mut ctx, 64, vk::Format::D32_SFLOAT, TextureUsage::DEPTH_TARGET);
        let shader = ctx.graphics_shader("triangle", &Default::default()).unwrap();
        let mut desc = GraphicsPipelineDesc::default().with_shader(shader);

        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.set_render_target_clear(0, color, [0.0, 0.0, 0.0, 1.0]);
        stream.set_depth_target_clear(depth, 0.0, 0);
        stream.propagate_rendering_info(&ctx, &mut desc);
        assert_eq!(desc.rendering.color_count, 1);
        assert_eq!(desc.rendering.depth_format, vk::Format::D32_SFLOAT);

        let pipeline = ctx.graphics_pipeline(&desc).unwrap();
        stream.set_graphics_pipeline(pipeline);
        assert!(!stream.is_rendering());
        stream.draw(&mut ctx, 3, 1, 0, 0);
        assert!(stream.is_rendering());

        let Some(Command::BeginRendering(info)) = stream
            .commands()
            .iter()
            .find(|command| matches!(command, Command::BeginRendering(_)))
        else {
            panic!("expected the pass to begin");
        };
        assert_eq!(info.area.extent.width, 64);
        assert_eq!(info.color[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(
            info.depth.unwrap().layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            stream.texture_touch(color).unwrap().initial,
            TextureUsage::COLOR_TARGET
        );
        // viewport and scissor default to the render area
        assert!(stream.commands().iter().any(|command| matches!(
            command,
            Command::SetViewport(viewport) if viewport.width == 64.0
        )));

        stream.end_render_pass();
        assert!(matches!(stream.commands().last(), Some(Command::EndRendering)));
        stream.destroy(&mut ctx);
    }

    #[test]
    fn test_rebinding_during_pass_is_ignored() {
        let mut ctx = headless_context();
        let first = target(&mut ctx, 32, vk::Format::R8G8B8A8_UNORM, TextureUsage::COLOR_TARGET);
        let second = target(&mut ctx, 32, vk::Format::R8G8B8A8_UNORM, TextureUsage::COLOR_TARGET);
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.set_render_target(0, first, false);
        stream.begin_render_pass(&mut ctx);
        stream.set_render_target(0, second, false);
        assert!(stream.texture_touch(second).is_none());
        stream.end_render_pass();
        stream.destroy(&mut ctx);
    }

    #[test]
    fn test_mismatched_targets_still_begin() {
        let mut ctx = headless_context();
        let large = target(&mut ctx, 64, vk::Format::R8G8B8A8_UNORM, TextureUsage::COLOR_TARGET);
        let small = target(&mut ctx, 32, vk::Format::R8G8B8A8_UNORM, TextureUsage::COLOR_TARGET);
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.set_render_target(0, large, true);
        stream.set_render_target(2, small, true);
        stream.begin_render_pass(&mut ctx);
        assert!(stream.is_rendering());
        let Some(Command::BeginRendering(info)) = stream
            .commands()
            .iter()
            .find(|command| matches!(command, Command::BeginRendering(_)))
        else {
            panic!("expected the pass to begin");
        };
        assert_eq!(info.color.len(), 3);
        assert_eq!(info.color[1].view, vk::ImageView::null());
        assert_eq!(info.area.extent.width, 64);
        stream.destroy(&mut ctx);
    }

    #[test]
    #[should_panic(expected = "outside a render pass")]
    fn test_draw_without_targets_panics() {
        let mut ctx = headless_context();
        let shader = ctx.graphics_shader("triangle", &Default::default()).unwrap();
        let pipeline = ctx
            .graphics_pipeline(&GraphicsPipelineDesc::default().with_shader(shader))
            .unwrap();
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.set_graphics_pipeline(pipeline);
        stream.draw(&mut ctx, 3, 1, 0, 0);
    }

    #[test]
    #[should_panic(expected = "inside an open render pass")]
    fn test_barrier_inside_pass_panics() {
        let mut ctx = headless_context();
        let color = target(
            &mut ctx,
            32,
            vk::Format::R8G8B8A8_UNORM,
            TextureUsage::COLOR_TARGET | TextureUsage::SAMPLE,
        );
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.set_render_target(0, color, false);
        stream.begin_render_pass(&mut ctx);
        stream.register_srv_texture(&mut ctx, color);
    }

    #[test]
    fn test_draw_without_pipeline_records_nothing() {
        let mut ctx = headless_context();
        let color = target(&mut ctx, 32, vk::Format::R8G8B8A8_UNORM, TextureUsage::COLOR_TARGET);
        let mut stream = CommandStream::new(None);
        stream.begin(&mut ctx).unwrap();
        stream.set_render_target(0, color, false);
        stream.draw(&mut ctx, 3, 1, 0, 0);
        assert!(!stream
            .commands()
            .iter()
            .any(|command| matches!(command, Command::Draw { .. })));
        // targets stay rebindable, the pass was never opened
        assert!(!stream.is_rendering());
        assert!(stream.texture_touch(color).is_none());
        stream.destroy(&mut ctx);
    }
}
