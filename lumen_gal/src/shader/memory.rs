use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use anyhow::Result;

use super::{CompiledStage, ShaderCompiler, ShaderDefines, ShaderStage};
use crate::GalError;

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Default)]
struct Source {
    stages: HashSet<ShaderStage>,
    dependencies: HashSet<String>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    sources: HashMap<String, Source>,
    failing: HashSet<String>,
    revision: u32,
    compilations: usize,
}

/// Compiler over registered, source-less shaders.
///
/// Output words encode the stage, the define count and the reload revision,
/// so a recompile is observable. Clones share state, which lets a caller keep
/// a handle after moving the compiler into a cache.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShaderCompiler {
    state: Rc<RefCell<InMemoryState>>,
}

impl InMemoryShaderCompiler {
    /// Registers a shader providing the entry points of `stages`
    pub fn add_source(&self, name: &str, stages: &[ShaderStage]) -> &Self {
        self.state.borrow_mut().sources.insert(
            name.to_string(),
            Source {
                stages: stages.iter().copied().collect(),
                dependencies: HashSet::new(),
            },
        );
        self
    }

    /// Records that `name` includes `dependency`
    pub fn add_dependency(&self, name: &str, dependency: &str) -> &Self {
        if let Some(source) = self.state.borrow_mut().sources.get_mut(name) {
            source.dependencies.insert(dependency.to_string());
        }
        self
    }

    /// Makes every compile of `name` fail until turned off again
    pub fn set_failing(&self, name: &str, failing: bool) {
        let mut state = self.state.borrow_mut();
        if failing {
            state.failing.insert(name.to_string());
        } else {
            state.failing.remove(name);
        }
    }

    pub fn compilations(&self) -> usize {
        self.state.borrow().compilations
    }
}

impl ShaderCompiler for InMemoryShaderCompiler {
    fn compile(
        &mut self,
        name: &str,
        stage: ShaderStage,
        entry_point: &str,
        defines: &ShaderDefines,
    ) -> Result<CompiledStage> {
        let mut state = self.state.borrow_mut();
        state.compilations += 1;
        if state.failing.contains(name) {
            return Err(GalError::ShaderCompilation {
                name: name.to_string(),
                stage,
                message: format!("{entry_point}: simulated failure"),
            }
            .into());
        }
        let revision = state.revision;
        let source = state.sources.get(name).ok_or_else(|| GalError::ShaderCompilation {
            name: name.to_string(),
            stage,
            message: "no such shader".to_string(),
        })?;
        if !source.stages.contains(&stage) {
            return Err(GalError::ShaderStageMissing(format!("{name}:{entry_point}")).into());
        }
        Ok(CompiledStage {
            spirv: vec![
                SPIRV_MAGIC,
                stage as u32,
                defines.iter().count() as u32,
                revision,
            ],
            dependencies: source.dependencies.clone(),
        })
    }

    fn reload(&mut self, _changed: &HashSet<String>) -> Result<()> {
        self.state.borrow_mut().revision += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::ShaderCache;

    #[test]
    fn test_missing_stage_is_reported() {
        let mut compiler = InMemoryShaderCompiler::default();
        compiler.add_source("blit", &[ShaderStage::Vertex, ShaderStage::Pixel]);
        let err = compiler
            .compile("blit", ShaderStage::Task, "MainTS", &ShaderDefines::new())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GalError>(),
            Some(GalError::ShaderStageMissing(_))
        ));
    }

    #[test]
    fn test_failed_recompile_keeps_binaries() {
        let compiler = InMemoryShaderCompiler::default();
        compiler.add_source("sky", &[ShaderStage::Vertex, ShaderStage::Pixel]);
        let mut cache = ShaderCache::new(Box::new(compiler.clone()));
        let sky = cache.get_graphics("sky", &ShaderDefines::new()).unwrap();
        let before = cache.shader(sky).binaries().to_vec();

        compiler.set_failing("sky", true);
        let recreated = cache.recreate_on_shader_changes(&HashSet::from(["sky".to_string()]));
        assert!(recreated.is_empty());
        assert_eq!(cache.shader(sky).binaries(), before.as_slice());

        compiler.set_failing("sky", false);
        let recreated = cache.recreate_on_shader_changes(&HashSet::from(["sky".to_string()]));
        assert!(recreated.contains(&sky));
    }
}
