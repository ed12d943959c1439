use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use anyhow::Result;
use ash::vk;
use tracing::error;

use super::{ComputePipelineId, GraphicsPipelineDesc, GraphicsPipelineId};
use crate::device::Device;
use crate::shader::{ShaderCache, ShaderId, ShaderKind};

#[derive(Debug)]
struct Entry<K> {
    key: K,
    shader: ShaderId,
    /// Empty after a failed recompile
    pipeline: Option<vk::Pipeline>,
}

/// Pipelines by key, with indices that stay valid across recompiles
#[derive(Debug)]
struct Entries<K> {
    lookup: HashMap<K, u32>,
    entries: Vec<Entry<K>>,
}

impl<K> Default for Entries<K> {
    fn default() -> Self {
        Self {
            lookup: HashMap::new(),
            entries: Vec::new(),
        }
    }
}

impl<K: Clone + Eq + Hash> Entries<K> {
    fn get_or_build(
        &mut self,
        key: &K,
        shader: ShaderId,
        build: impl FnOnce() -> Result<vk::Pipeline>,
    ) -> Result<u32> {
        if let Some(&index) = self.lookup.get(key) {
            let entry = &mut self.entries[index as usize];
            if entry.pipeline.is_none() {
                entry.pipeline = Some(build()?);
            }
            return Ok(index);
        }
        let pipeline = build()?;
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            key: key.clone(),
            shader,
            pipeline: Some(pipeline),
        });
        self.lookup.insert(key.clone(), index);
        Ok(index)
    }

    fn raw(&self, index: u32) -> Option<vk::Pipeline> {
        self.entries
            .get(index as usize)
            .and_then(|entry| entry.pipeline)
    }

    fn recreate<D: Device>(
        &mut self,
        device: &mut D,
        changed: &HashSet<ShaderId>,
        mut build: impl FnMut(&mut D, &K, ShaderId) -> Result<vk::Pipeline>,
    ) -> usize {
        let mut recreated = 0;
        for entry in self.entries.iter_mut() {
            if !changed.contains(&entry.shader) {
                continue;
            }
            if let Some(pipeline) = entry.pipeline.take() {
                device.destroy_pipeline(pipeline);
            }
            match build(device, &entry.key, entry.shader) {
                Ok(pipeline) => {
                    entry.pipeline = Some(pipeline);
                    recreated += 1;
                }
                Err(err) => {
                    error!(?err, shader = ?entry.shader, "Failed to recreate pipeline");
                }
            }
        }
        recreated
    }

    fn destroy<D: Device>(&mut self, device: &mut D) {
        for entry in self.entries.drain(..) {
            if let Some(pipeline) = entry.pipeline {
                device.destroy_pipeline(pipeline);
            }
        }
        self.lookup.clear();
    }
}

fn build_graphics<D: Device>(
    device: &mut D,
    shaders: &ShaderCache,
    desc: &GraphicsPipelineDesc,
    shader: ShaderId,
) -> Result<vk::Pipeline> {
    let shader = shaders.shader(shader);
    if shader.kind() == ShaderKind::Compute {
        return Err(anyhow::anyhow!(
            "Compute shader {} used in a graphics pipeline",
            shader.name()
        ));
    }
    device.create_graphics_pipeline(desc, shader.binaries())
}

fn build_compute<D: Device>(
    device: &mut D,
    shaders: &ShaderCache,
    shader: ShaderId,
) -> Result<vk::Pipeline> {
    let shader = shaders.shader(shader);
    match (shader.kind(), shader.binaries().first()) {
        (ShaderKind::Compute, Some(binary)) => device.create_compute_pipeline(binary),
        _ => Err(anyhow::anyhow!(
            "Shader {} is not a compute shader",
            shader.name()
        )),
    }
}

/// Graphics pipelines keyed by their full [`GraphicsPipelineDesc`]
#[derive(Debug, Default)]
pub struct GraphicsPipelineCache {
    entries: Entries<GraphicsPipelineDesc>,
}

impl GraphicsPipelineCache {
    /// Compiles on a miss. Failures are logged and not cached, so the next
    /// request retries.
    pub fn get<D: Device>(
        &mut self,
        device: &mut D,
        shaders: &ShaderCache,
        desc: &GraphicsPipelineDesc,
    ) -> Option<GraphicsPipelineId> {
        let Some(shader) = desc.shader else {
            error!("Graphics pipeline requested without a shader");
            return None;
        };
        match self
            .entries
            .get_or_build(desc, shader, || build_graphics(device, shaders, desc, shader))
        {
            Ok(index) => Some(GraphicsPipelineId(index)),
            Err(err) => {
                error!(?err, ?shader, "Failed to create graphics pipeline");
                None
            }
        }
    }

    pub fn raw(&self, id: GraphicsPipelineId) -> Option<vk::Pipeline> {
        self.entries.raw(id.0)
    }

    /// Rebuilds in place every pipeline made from one of `changed`
    pub fn recreate_on_shader_changed<D: Device>(
        &mut self,
        device: &mut D,
        shaders: &ShaderCache,
        changed: &HashSet<ShaderId>,
    ) -> usize {
        self.entries.recreate(device, changed, |device, desc, shader| {
            build_graphics(device, shaders, desc, shader)
        })
    }

    pub fn len(&self) -> usize {
        self.entries.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.entries.is_empty()
    }

    pub fn destroy<D: Device>(&mut self, device: &mut D) {
        self.entries.destroy(device);
    }
}

/// Compute pipelines keyed by their shader
#[derive(Debug, Default)]
pub struct ComputePipelineCache {
    entries: Entries<ShaderId>,
}

impl ComputePipelineCache {
    pub fn get<D: Device>(
        &mut self,
        device: &mut D,
        shaders: &ShaderCache,
        shader: ShaderId,
    ) -> Option<ComputePipelineId> {
        match self
            .entries
            .get_or_build(&shader, shader, || build_compute(device, shaders, shader))
        {
            Ok(index) => Some(ComputePipelineId(index)),
            Err(err) => {
                error!(?err, ?shader, "Failed to create compute pipeline");
                None
            }
        }
    }

    pub fn raw(&self, id: ComputePipelineId) -> Option<vk::Pipeline> {
        self.entries.raw(id.0)
    }

    pub fn recreate_on_shader_changed<D: Device>(
        &mut self,
        device: &mut D,
        shaders: &ShaderCache,
        changed: &HashSet<ShaderId>,
    ) -> usize {
        self.entries.recreate(device, changed, |device, _, shader| {
            build_compute(device, shaders, shader)
        })
    }

    pub fn len(&self) -> usize {
        self.entries.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.entries.is_empty()
    }

    pub fn destroy<D: Device>(&mut self, device: &mut D) {
        self.entries.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::headless_context;
    use crate::shader::ShaderDefines;

    #[test]
    fn test_compute_pipeline_compiles_once() {
        let mut ctx = headless_context();
        let shader = ctx.compute_shader("cull", &ShaderDefines::new()).unwrap();
        let again = ctx.compute_shader("cull", &ShaderDefines::new()).unwrap();
        assert_eq!(shader, again);

        let a = ctx.compute_pipeline(shader).unwrap();
        let b = ctx.compute_pipeline(again).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.device().pipelines_created(), 1);
        assert_eq!(ctx.compute_pipelines.len(), 1);
    }

    #[test]
    fn test_inert_fields_share_a_pipeline() {
        let mut ctx = headless_context();
        let shader = ctx.graphics_shader("triangle", &ShaderDefines::new()).unwrap();
        let plain = GraphicsPipelineDesc::default().with_shader(shader);
        let mut noisy = plain.clone();
        noisy.blend.attachments[0].dst_color = vk::BlendFactor::ONE;
        noisy.depth_stencil.depth_compare = vk::CompareOp::GREATER;

        let a = ctx.graphics_pipeline(&plain).unwrap();
        let b = ctx.graphics_pipeline(&noisy).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.device().pipelines_created(), 1);
    }

    #[test]
    fn test_unbound_slot_blending_shares_a_pipeline() {
        let mut ctx = headless_context();
        let shader = ctx.graphics_shader("triangle", &ShaderDefines::new()).unwrap();
        let mut plain = GraphicsPipelineDesc::default().with_shader(shader);
        plain.rendering.color_count = 1;
        plain.rendering.color_formats[0] = vk::Format::B8G8R8A8_SRGB;
        let blended = plain.clone().enable_blending_alpha_blend(3);

        let a = ctx.graphics_pipeline(&plain).unwrap();
        let b = ctx.graphics_pipeline(&blended).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.device().pipelines_created(), 1);
        assert_eq!(ctx.graphics_pipelines.len(), 1);
    }

    #[test]
    fn test_failure_is_not_cached() {
        let mut ctx = headless_context();
        let shader = ctx.compute_shader("cull", &ShaderDefines::new()).unwrap();
        ctx.device_mut().set_fail_pipelines(true);
        assert!(ctx.compute_pipeline(shader).is_none());
        assert!(ctx.compute_pipelines.is_empty());

        ctx.device_mut().set_fail_pipelines(false);
        assert!(ctx.compute_pipeline(shader).is_some());
    }

    #[test]
    fn test_missing_shader_is_reported() {
        let mut ctx = headless_context();
        assert!(ctx.graphics_pipeline(&GraphicsPipelineDesc::default()).is_none());
        assert_eq!(ctx.device().pipelines_created(), 0);
    }

    #[test]
    fn test_compute_shader_in_graphics_pipeline_fails() {
        let mut ctx = headless_context();
        let shader = ctx.compute_shader("cull", &ShaderDefines::new()).unwrap();
        let desc = GraphicsPipelineDesc::default().with_shader(shader);
        assert!(ctx.graphics_pipeline(&desc).is_none());
    }

    #[test]
    fn test_reload_keeps_ids_and_swaps_objects() {
        let mut ctx = headless_context();
        let shader = ctx.compute_shader("cull", &ShaderDefines::new()).unwrap();
        let pipeline = ctx.compute_pipeline(shader).unwrap();
        let before = ctx.compute_pipelines.raw(pipeline).unwrap();

        ctx.reload_shaders(&HashSet::from(["cull".to_string()]));
        let after = ctx.compute_pipelines.raw(pipeline).unwrap();
        assert_ne!(before, after);
        assert_eq!(ctx.compute_pipeline(shader), Some(pipeline));
    }

    #[test]
    fn test_failed_reload_leaves_entry_empty_until_requested() {
        let mut ctx = headless_context();
        let shader = ctx.compute_shader("cull", &ShaderDefines::new()).unwrap();
        let pipeline = ctx.compute_pipeline(shader).unwrap();

        ctx.device_mut().set_fail_pipelines(true);
        ctx.reload_shaders(&HashSet::from(["cull".to_string()]));
        assert!(ctx.compute_pipelines.raw(pipeline).is_none());

        ctx.device_mut().set_fail_pipelines(false);
        assert_eq!(ctx.compute_pipeline(shader), Some(pipeline));
        assert!(ctx.compute_pipelines.raw(pipeline).is_some());
    }
}
