use std::hash::{Hash, Hasher};

use ash::vk;

use crate::command::MAX_COLOR_TARGETS;
use crate::shader::ShaderId;

/// Attachment formats a pipeline renders into
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct RenderingFormats {
    pub view_mask: u32,
    pub color_formats: [vk::Format; MAX_COLOR_TARGETS],
    pub color_count: u32,
    pub depth_format: vk::Format,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InputAssemblyState {
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,
}

impl Default for InputAssemblyState {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RasterizationState {
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_clamp: bool,
    pub depth_bias_enable: bool,
    pub depth_bias_constant: f32,
    pub depth_bias_clamp: f32,
    pub depth_bias_slope: f32,
    pub line_width: f32,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_clamp: false,
            depth_bias_enable: false,
            depth_bias_constant: 0.0,
            depth_bias_clamp: 0.0,
            depth_bias_slope: 0.0,
            line_width: 1.0,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StencilFace {
    pub fail_op: vk::StencilOp,
    pub pass_op: vk::StencilOp,
    pub depth_fail_op: vk::StencilOp,
    pub compare_op: vk::CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

impl Default for StencilFace {
    fn default() -> Self {
        Self {
            fail_op: vk::StencilOp::KEEP,
            pass_op: vk::StencilOp::KEEP,
            depth_fail_op: vk::StencilOp::KEEP,
            compare_op: vk::CompareOp::ALWAYS,
            compare_mask: 0xFF,
            write_mask: 0xFF,
            reference: 0,
        }
    }
}

impl From<StencilFace> for vk::StencilOpState {
    fn from(value: StencilFace) -> Self {
        vk::StencilOpState {
            fail_op: value.fail_op,
            pass_op: value.pass_op,
            depth_fail_op: value.depth_fail_op,
            compare_op: value.compare_op,
            compare_mask: value.compare_mask,
            write_mask: value.write_mask,
            reference: value.reference,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub depth_bounds_test: bool,
    pub min_depth_bounds: f32,
    pub max_depth_bounds: f32,
    pub stencil_test: bool,
    pub front: StencilFace,
    pub back: StencilFace,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::NEVER,
            depth_bounds_test: false,
            min_depth_bounds: 0.0,
            max_depth_bounds: 1.0,
            stencil_test: false,
            front: StencilFace::default(),
            back: StencilFace::default(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BlendAttachment {
    pub blend_enable: bool,
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub color_op: vk::BlendOp,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
    pub alpha_op: vk::BlendOp,
    pub write_mask: vk::ColorComponentFlags,
}

impl Default for BlendAttachment {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color: vk::BlendFactor::ONE,
            dst_color: vk::BlendFactor::ZERO,
            color_op: vk::BlendOp::ADD,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ZERO,
            alpha_op: vk::BlendOp::ADD,
            write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

impl BlendAttachment {
    pub fn alpha_blend() -> Self {
        Self {
            blend_enable: true,
            src_color: vk::BlendFactor::SRC_ALPHA,
            dst_color: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            ..Default::default()
        }
    }

    pub fn additive() -> Self {
        Self {
            blend_enable: true,
            src_color: vk::BlendFactor::SRC_ALPHA,
            dst_color: vk::BlendFactor::ONE,
            ..Default::default()
        }
    }

    fn canonical(&self) -> Self {
        if self.blend_enable {
            *self
        } else {
            Self {
                write_mask: self.write_mask,
                ..Default::default()
            }
        }
    }
}

impl From<BlendAttachment> for vk::PipelineColorBlendAttachmentState {
    fn from(value: BlendAttachment) -> Self {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: value.blend_enable as vk::Bool32,
            src_color_blend_factor: value.src_color,
            dst_color_blend_factor: value.dst_color,
            color_blend_op: value.color_op,
            src_alpha_blend_factor: value.src_alpha,
            dst_alpha_blend_factor: value.dst_alpha,
            alpha_blend_op: value.alpha_op,
            color_write_mask: value.write_mask,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub logic_op_enable: bool,
    pub logic_op: vk::LogicOp,
    pub attachments: [BlendAttachment; MAX_COLOR_TARGETS],
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            logic_op_enable: false,
            logic_op: vk::LogicOp::COPY,
            attachments: [BlendAttachment::default(); MAX_COLOR_TARGETS],
        }
    }
}

/// Full description of a graphics pipeline.
///
/// Equality and hashing only look at fields that take effect, so e.g. blend
/// factors of a disabled attachment never cause a second compile.
#[derive(Debug, Clone, Default)]
pub struct GraphicsPipelineDesc {
    pub shader: Option<ShaderId>,
    pub rendering: RenderingFormats,
    pub input_assembly: InputAssemblyState,
    pub rasterization: RasterizationState,
    pub depth_stencil: DepthStencilState,
    pub blend: BlendState,
}

#[derive(PartialEq, Eq, Hash)]
struct DescKey {
    shader: Option<ShaderId>,
    rendering: RenderingFormats,
    input_assembly: InputAssemblyState,
    polygon_mode: vk::PolygonMode,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    depth_clamp: bool,
    depth_bias: Option<[u32; 3]>,
    line_width: u32,
    depth: Option<(bool, vk::CompareOp)>,
    depth_bounds: Option<[u32; 2]>,
    stencil: Option<(StencilFace, StencilFace)>,
    logic_op: Option<vk::LogicOp>,
    attachments: [BlendAttachment; MAX_COLOR_TARGETS],
}

impl GraphicsPipelineDesc {
    fn key(&self) -> DescKey {
        let rasterization = &self.rasterization;
        let depth_stencil = &self.depth_stencil;
        let mut rendering = self.rendering;
        let used = (rendering.color_count as usize).min(MAX_COLOR_TARGETS);
        rendering.color_formats[used..].fill(vk::Format::UNDEFINED);
        let mut attachments = self.blend.attachments.map(|attachment| attachment.canonical());
        attachments[used..].fill(BlendAttachment::default());
        DescKey {
            shader: self.shader,
            rendering,
            input_assembly: self.input_assembly,
            polygon_mode: rasterization.polygon_mode,
            cull_mode: rasterization.cull_mode,
            front_face: rasterization.front_face,
            depth_clamp: rasterization.depth_clamp,
            depth_bias: rasterization.depth_bias_enable.then(|| {
                [
                    rasterization.depth_bias_constant.to_bits(),
                    rasterization.depth_bias_clamp.to_bits(),
                    rasterization.depth_bias_slope.to_bits(),
                ]
            }),
            line_width: rasterization.line_width.to_bits(),
            depth: depth_stencil
                .depth_test
                .then_some((depth_stencil.depth_write, depth_stencil.depth_compare)),
            depth_bounds: depth_stencil.depth_bounds_test.then(|| {
                [
                    depth_stencil.min_depth_bounds.to_bits(),
                    depth_stencil.max_depth_bounds.to_bits(),
                ]
            }),
            stencil: depth_stencil
                .stencil_test
                .then_some((depth_stencil.front, depth_stencil.back)),
            logic_op: self.blend.logic_op_enable.then_some(self.blend.logic_op),
            attachments,
        }
    }

    pub fn with_shader(mut self, shader: ShaderId) -> Self {
        self.shader = Some(shader);
        self
    }

    pub fn set_topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.input_assembly.topology = topology;
        self.input_assembly.primitive_restart = false;
        self
    }

    pub fn set_polygon_mode(mut self, polygon_mode: vk::PolygonMode) -> Self {
        self.rasterization.polygon_mode = polygon_mode;
        self.rasterization.line_width = 1.0;
        self
    }

    pub fn set_cull_mode(mut self, cull_mode: vk::CullModeFlags, front_face: vk::FrontFace) -> Self {
        self.rasterization.cull_mode = cull_mode;
        self.rasterization.front_face = front_face;
        self
    }

    pub fn set_depth_test(mut self, depth_write: bool, compare: vk::CompareOp) -> Self {
        self.depth_stencil.depth_test = true;
        self.depth_stencil.depth_write = depth_write;
        self.depth_stencil.depth_compare = compare;
        self
    }

    pub fn disable_depth_test(mut self) -> Self {
        self.depth_stencil = DepthStencilState::default();
        self
    }

    pub fn set_depth_bias(mut self, constant: f32, clamp: f32, slope: f32) -> Self {
        self.rasterization.depth_bias_enable = true;
        self.rasterization.depth_bias_constant = constant;
        self.rasterization.depth_bias_clamp = clamp;
        self.rasterization.depth_bias_slope = slope;
        self
    }

    pub fn set_depth_bounds(mut self, min: f32, max: f32) -> Self {
        self.depth_stencil.depth_bounds_test = true;
        self.depth_stencil.min_depth_bounds = min;
        self.depth_stencil.max_depth_bounds = max;
        self
    }

    pub fn set_stencil(mut self, front: StencilFace, back: StencilFace) -> Self {
        self.depth_stencil.stencil_test = true;
        self.depth_stencil.front = front;
        self.depth_stencil.back = back;
        self
    }

    pub fn set_blending(mut self, slot: usize, attachment: BlendAttachment) -> Self {
        self.blend.attachments[slot] = attachment;
        self
    }

    pub fn enable_blending_alpha_blend(self, slot: usize) -> Self {
        self.set_blending(slot, BlendAttachment::alpha_blend())
    }

    pub fn enable_blending_additive(self, slot: usize) -> Self {
        self.set_blending(slot, BlendAttachment::additive())
    }

    pub fn disable_blending(mut self, slot: usize) -> Self {
        let write_mask = self.blend.attachments[slot].write_mask;
        self.blend.attachments[slot] = BlendAttachment {
            write_mask,
            ..Default::default()
        };
        self
    }

    pub fn set_logic_op(mut self, logic_op: vk::LogicOp) -> Self {
        self.blend.logic_op_enable = true;
        self.blend.logic_op = logic_op;
        self
    }
}

impl PartialEq for GraphicsPipelineDesc {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for GraphicsPipelineDesc {}

impl Hash for GraphicsPipelineDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;

    fn hash_of(desc: &GraphicsPipelineDesc) -> u64 {
        let mut hasher = DefaultHasher::new();
        desc.hash(&mut hasher);
        hasher.finish()
    }

    fn one_target() -> GraphicsPipelineDesc {
        let mut desc = GraphicsPipelineDesc::default();
        desc.rendering.color_count = 1;
        desc.rendering.color_formats[0] = vk::Format::R8G8B8A8_UNORM;
        desc
    }

    #[test]
    fn test_disabled_blend_factors_are_ignored() {
        let a = one_target();
        let mut b = one_target();
        b.blend.attachments[0].src_color = vk::BlendFactor::DST_COLOR;
        b.blend.logic_op = vk::LogicOp::XOR;
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let blended = one_target().enable_blending_alpha_blend(0);
        assert_ne!(a, blended);
    }

    #[test]
    fn test_disabled_depth_state_is_ignored() {
        let a = GraphicsPipelineDesc::default();
        let mut b = GraphicsPipelineDesc::default();
        b.depth_stencil.depth_write = true;
        b.depth_stencil.depth_compare = vk::CompareOp::GREATER;
        b.depth_stencil.min_depth_bounds = 0.5;
        b.depth_stencil.front.pass_op = vk::StencilOp::REPLACE;
        b.rasterization.depth_bias_slope = 2.0;
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_enabled_state_is_compared() {
        let a = GraphicsPipelineDesc::default().set_depth_test(true, vk::CompareOp::GREATER);
        let b = GraphicsPipelineDesc::default().set_depth_test(true, vk::CompareOp::LESS);
        assert_ne!(a, b);
        let c = GraphicsPipelineDesc::default().set_depth_bias(1.0, 0.0, 1.0);
        let d = GraphicsPipelineDesc::default().set_depth_bias(1.0, 0.0, 2.0);
        assert_ne!(c, d);
    }

    #[test]
    fn test_write_mask_matters_without_blending() {
        let a = one_target();
        let mut b = one_target();
        b.blend.attachments[0].write_mask = vk::ColorComponentFlags::R;
        assert_ne!(a, b);
    }

    #[test]
    fn test_formats_past_color_count_are_ignored() {
        let mut a = GraphicsPipelineDesc::default();
        a.rendering.color_count = 1;
        a.rendering.color_formats[0] = vk::Format::R8G8B8A8_UNORM;
        let mut b = a.clone();
        b.rendering.color_formats[3] = vk::Format::R16G16B16A16_SFLOAT;
        assert_eq!(a, b);
    }

    #[test]
    fn test_blending_past_color_count_is_ignored() {
        let a = one_target();
        let b = one_target()
            .enable_blending_additive(1)
            .enable_blending_alpha_blend(MAX_COLOR_TARGETS - 1);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let mut c = one_target().enable_blending_additive(1);
        c.rendering.color_count = 2;
        c.rendering.color_formats[1] = vk::Format::R8G8B8A8_UNORM;
        let mut d = c.clone();
        d.blend.attachments[1] = BlendAttachment::default();
        assert_ne!(c, d);
    }
}
