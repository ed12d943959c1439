use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use shaderc::{IncludeType, ResolvedInclude};

use super::{CompiledStage, ShaderCompiler, ShaderDefines, ShaderStage};
use crate::GalError;

/// Implementation of [`shaderc`] compiler for HLSL sources under a root directory
pub struct ShadercCompiler {
    handle: shaderc::Compiler,
    root: PathBuf,
}

impl ShadercCompiler {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            handle: shaderc::Compiler::new().map_err(|_| GalError::ShadercError)?,
            root: root.into(),
        })
    }

    fn source_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.hlsl"))
    }
}

impl From<ShaderStage> for shaderc::ShaderKind {
    fn from(value: ShaderStage) -> Self {
        match value {
            ShaderStage::Task => shaderc::ShaderKind::Task,
            ShaderStage::Mesh => shaderc::ShaderKind::Mesh,
            ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
            ShaderStage::Pixel => shaderc::ShaderKind::Fragment,
            ShaderStage::Compute => shaderc::ShaderKind::Compute,
        }
    }
}

impl ShaderCompiler for ShadercCompiler {
    fn compile(
        &mut self,
        name: &str,
        stage: ShaderStage,
        entry_point: &str,
        defines: &ShaderDefines,
    ) -> Result<CompiledStage> {
        let path = self.source_path(name);
        let content = std::fs::read_to_string(&path)?;
        if !content.contains(entry_point) {
            return Err(GalError::ShaderStageMissing(format!("{name}:{entry_point}")).into());
        }

        let mut options = shaderc::CompileOptions::new().map_err(|_| GalError::ShadercError)?;
        options.set_source_language(shaderc::SourceLanguage::HLSL);
        options.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_3 as u32,
        );
        options.set_target_spirv(shaderc::SpirvVersion::V1_6);
        for (define, value) in defines.iter() {
            options.add_macro_definition(define, Some(value));
        }

        let dependencies = Arc::new(Mutex::new(HashSet::from([path
            .to_string_lossy()
            .to_string()])));
        let root = self.root.clone();
        options.set_include_callback({
            let dependencies = dependencies.clone();
            move |requested_path, include_type, including_path, _| {
                let include_path = match include_type {
                    IncludeType::Relative => PathBuf::from(including_path)
                        .parent()
                        .map(|parent| parent.join(requested_path))
                        .unwrap_or_else(|| PathBuf::from(requested_path)),
                    IncludeType::Standard => root.join(requested_path),
                };
                let content = std::fs::read_to_string(&include_path).map_err(|err| {
                    format!("Tried to #include {include_path:?} in {including_path}: {err}")
                })?;
                let resolved_name = include_path.to_string_lossy().to_string();
                if let Ok(mut guard) = dependencies.lock() {
                    guard.insert(resolved_name.clone());
                }
                Ok(ResolvedInclude {
                    resolved_name,
                    content,
                })
            }
        });

        let output = self
            .handle
            .compile_into_spirv(
                &content,
                stage.into(),
                &path.to_string_lossy(),
                entry_point,
                Some(&options),
            )
            .map_err(|err| GalError::ShaderCompilation {
                name: name.to_string(),
                stage,
                message: err.to_string(),
            })?;
        drop(options);

        let dependencies = dependencies
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        Ok(CompiledStage {
            spirv: output.as_binary().to_vec(),
            dependencies,
        })
    }
}
