use std::collections::HashSet;

use anyhow::Result;

use super::{ShaderDefines, ShaderStage};

/// Output of compiling one stage
#[derive(Debug, Clone, Default)]
pub struct CompiledStage {
    pub spirv: Vec<u32>,
    /// Every file the stage was built from, includes too
    pub dependencies: HashSet<String>,
}

/// Responsible for compiling shader sources into SPIR-V.
///
/// A source that lacks the requested entry point must fail with
/// [`crate::GalError::ShaderStageMissing`], so optional stages can be skipped.
pub trait ShaderCompiler {
    fn compile(
        &mut self,
        name: &str,
        stage: ShaderStage,
        entry_point: &str,
        defines: &ShaderDefines,
    ) -> Result<CompiledStage>;

    /// Called before changed shaders are recompiled
    fn reload(&mut self, _changed: &HashSet<String>) -> Result<()> {
        Ok(())
    }
}
