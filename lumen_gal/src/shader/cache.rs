use std::collections::{HashMap, HashSet};

use anyhow::Result;
use derivative::Derivative;
use tracing::error;

use super::{ShaderBinary, ShaderCompiler, ShaderDefines, ShaderId, ShaderKind, ShaderStage};
use crate::GalError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShaderKey {
    name: String,
    kind: ShaderKind,
    defines: ShaderDefines,
}

/// Compiled stages of one (name, kind, defines) combination
#[derive(Debug)]
pub struct Shader {
    key: ShaderKey,
    binaries: Vec<ShaderBinary>,
    dependencies: HashSet<String>,
}

impl Shader {
    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn kind(&self) -> ShaderKind {
        self.key.kind
    }

    pub fn defines(&self) -> &ShaderDefines {
        &self.key.defines
    }

    /// Stages in pipeline order
    pub fn binaries(&self) -> &[ShaderBinary] {
        &self.binaries
    }

    pub fn dependencies(&self) -> &HashSet<String> {
        &self.dependencies
    }
}

fn is_stage_missing(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<GalError>(),
        Some(GalError::ShaderStageMissing(_))
    )
}

/// Compiles each shader once and hands out stable [`ShaderId`]s
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ShaderCache {
    #[derivative(Debug = "ignore")]
    compiler: Box<dyn ShaderCompiler>,
    lookup: HashMap<ShaderKey, ShaderId>,
    shaders: Vec<Shader>,
}

impl ShaderCache {
    pub fn new(compiler: Box<dyn ShaderCompiler>) -> Self {
        Self {
            compiler,
            lookup: HashMap::new(),
            shaders: Vec::new(),
        }
    }

    pub fn get_graphics(&mut self, name: &str, defines: &ShaderDefines) -> Option<ShaderId> {
        self.get(name, ShaderKind::Graphics, defines)
    }

    pub fn get_mesh(&mut self, name: &str, defines: &ShaderDefines) -> Option<ShaderId> {
        self.get(name, ShaderKind::MeshGraphics, defines)
    }

    pub fn get_compute(&mut self, name: &str, defines: &ShaderDefines) -> Option<ShaderId> {
        self.get(name, ShaderKind::Compute, defines)
    }

    fn get(&mut self, name: &str, kind: ShaderKind, defines: &ShaderDefines) -> Option<ShaderId> {
        let key = ShaderKey {
            name: name.to_string(),
            kind,
            defines: defines.clone(),
        };
        if let Some(id) = self.lookup.get(&key) {
            return Some(*id);
        }
        match self.build(&key) {
            Ok((binaries, dependencies)) => {
                let id = ShaderId(self.shaders.len() as u32);
                self.shaders.push(Shader {
                    key: key.clone(),
                    binaries,
                    dependencies,
                });
                self.lookup.insert(key, id);
                Some(id)
            }
            Err(err) => {
                error!(?err, name, ?kind, "Failed to build shader");
                None
            }
        }
    }

    fn build(&mut self, key: &ShaderKey) -> Result<(Vec<ShaderBinary>, HashSet<String>)> {
        let mut binaries = Vec::new();
        let mut dependencies = HashSet::new();
        let required: &[ShaderStage] = match key.kind {
            ShaderKind::Graphics => &[ShaderStage::Vertex, ShaderStage::Pixel],
            ShaderKind::MeshGraphics => {
                match self.compile_stage(key, ShaderStage::Task, &mut binaries, &mut dependencies) {
                    Ok(()) => {}
                    Err(err) if is_stage_missing(&err) => {}
                    Err(err) => return Err(err),
                }
                &[ShaderStage::Mesh, ShaderStage::Pixel]
            }
            ShaderKind::Compute => &[ShaderStage::Compute],
        };
        for stage in required {
            self.compile_stage(key, *stage, &mut binaries, &mut dependencies)?;
        }
        Ok((binaries, dependencies))
    }

    fn compile_stage(
        &mut self,
        key: &ShaderKey,
        stage: ShaderStage,
        binaries: &mut Vec<ShaderBinary>,
        dependencies: &mut HashSet<String>,
    ) -> Result<()> {
        let compiled =
            self.compiler
                .compile(&key.name, stage, stage.entry_point(), &key.defines)?;
        binaries.push(ShaderBinary {
            stage,
            entry_point: stage.entry_point().to_string(),
            spirv: compiled.spirv,
        });
        dependencies.insert(key.name.clone());
        dependencies.extend(compiled.dependencies);
        Ok(())
    }

    /// # Panics
    /// If `id` was not handed out by this cache
    pub fn shader(&self, id: ShaderId) -> &Shader {
        &self.shaders[id.index()]
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    /// Recompiles in place every shader built from one of `changed`.
    ///
    /// Ids stay valid. A shader that fails to recompile keeps its previous binaries.
    pub fn recreate_on_shader_changes(&mut self, changed: &HashSet<String>) -> HashSet<ShaderId> {
        if let Err(err) = self.compiler.reload(changed) {
            error!(?err, "Shader compiler failed to reload");
        }
        let mut recreated = HashSet::new();
        for index in 0..self.shaders.len() {
            let shader = &self.shaders[index];
            if shader.dependencies.is_disjoint(changed) && !changed.contains(shader.name()) {
                continue;
            }
            let key = shader.key.clone();
            match self.build(&key) {
                Ok((binaries, dependencies)) => {
                    let shader = &mut self.shaders[index];
                    shader.binaries = binaries;
                    shader.dependencies = dependencies;
                    recreated.insert(ShaderId(index as u32));
                }
                Err(err) => {
                    error!(
                        ?err,
                        name = %key.name,
                        "Failed to recompile shader, keeping the previous binaries"
                    );
                }
            }
        }
        recreated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::InMemoryShaderCompiler;

    fn cache() -> ShaderCache {
        let compiler = InMemoryShaderCompiler::default();
        compiler
            .add_source("mesh", &[ShaderStage::Vertex, ShaderStage::Pixel])
            .add_source("meshlet", &[ShaderStage::Mesh, ShaderStage::Pixel])
            .add_source(
                "amplified",
                &[ShaderStage::Task, ShaderStage::Mesh, ShaderStage::Pixel],
            )
            .add_source("cull", &[ShaderStage::Compute])
            .add_dependency("cull", "common.hlsli");
        ShaderCache::new(Box::new(compiler))
    }

    #[test]
    fn test_identical_requests_share_an_id() {
        let mut cache = cache();
        let defines = ShaderDefines::new().with("LOD", "1");
        let a = cache.get_compute("cull", &defines).unwrap();
        let b = cache.get_compute("cull", &defines).unwrap();
        let c = cache.get_compute("cull", &ShaderDefines::new()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_graphics_stages() {
        let mut cache = cache();
        let id = cache.get_graphics("mesh", &ShaderDefines::new()).unwrap();
        let stages: Vec<ShaderStage> = cache
            .shader(id)
            .binaries()
            .iter()
            .map(|binary| binary.stage)
            .collect();
        assert_eq!(stages, vec![ShaderStage::Vertex, ShaderStage::Pixel]);
    }

    #[test]
    fn test_task_stage_is_optional() {
        let mut cache = cache();
        let without = cache.get_mesh("meshlet", &ShaderDefines::new()).unwrap();
        let with = cache.get_mesh("amplified", &ShaderDefines::new()).unwrap();
        assert_eq!(cache.shader(without).binaries().len(), 2);
        assert_eq!(cache.shader(with).binaries()[0].stage, ShaderStage::Task);
    }

    #[test]
    fn test_missing_vertex_stage_is_not_cached() {
        let mut cache = cache();
        assert!(cache.get_graphics("cull", &ShaderDefines::new()).is_none());
        assert!(cache.get_graphics("unknown", &ShaderDefines::new()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_dependency_change_recompiles() {
        let mut cache = cache();
        let cull = cache.get_compute("cull", &ShaderDefines::new()).unwrap();
        let mesh = cache.get_graphics("mesh", &ShaderDefines::new()).unwrap();
        let before = cache.shader(cull).binaries()[0].spirv.clone();

        let changed = HashSet::from(["common.hlsli".to_string()]);
        let recreated = cache.recreate_on_shader_changes(&changed);
        assert_eq!(recreated, HashSet::from([cull]));
        assert!(!recreated.contains(&mesh));
        assert_ne!(cache.shader(cull).binaries()[0].spirv, before);
    }
}
