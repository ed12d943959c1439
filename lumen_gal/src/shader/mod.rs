/// Provides traits for whatever shader provider you wish to use to compile & process your shaders
pub mod traits;
pub use traits::*;
pub mod cache;
pub use cache::{Shader, ShaderCache};
pub mod memory;
pub use memory::InMemoryShaderCompiler;

#[cfg(feature = "shaderc")]
pub mod shaderc_impl;
#[cfg(feature = "shaderc")]
pub use shaderc_impl::*;

use ash::vk;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Task,
    Mesh,
    Vertex,
    Pixel,
    Compute,
}

impl ShaderStage {
    pub fn flags(&self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Task => vk::ShaderStageFlags::TASK_EXT,
            ShaderStage::Mesh => vk::ShaderStageFlags::MESH_EXT,
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Pixel => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    pub fn entry_point(&self) -> &'static str {
        match self {
            ShaderStage::Task => "MainTS",
            ShaderStage::Mesh => "MainMS",
            ShaderStage::Vertex => "MainVS",
            ShaderStage::Pixel => "MainPS",
            ShaderStage::Compute => "MainCS",
        }
    }
}

/// Which stages a shader is built from
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    /// Vertex and pixel
    Graphics,
    /// Optional task, then mesh and pixel
    MeshGraphics,
    Compute,
}

/// Preprocessor defines, kept sorted so insertion order does not matter
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct ShaderDefines {
    defines: Vec<(String, String)>,
}

impl ShaderDefines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a define
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self.defines.binary_search_by(|(existing, _)| existing.cmp(&name)) {
            Ok(index) => self.defines[index].1 = value,
            Err(index) => self.defines.insert(index, (name, value)),
        }
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(name, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.defines
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.defines.is_empty()
    }
}

/// Compiled SPIR-V for one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBinary {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub spirv: Vec<u32>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderId(pub(crate) u32);

impl ShaderId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defines_ignore_insertion_order() {
        let a = ShaderDefines::new().with("B", "1").with("A", "2");
        let b = ShaderDefines::new().with("A", "2").with("B", "1");
        assert_eq!(a, b);
        let names: Vec<&str> = a.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_define_is_replaced() {
        let mut defines = ShaderDefines::new();
        defines.add("USE_SHADOWS", "0").add("USE_SHADOWS", "1");
        assert_eq!(defines.iter().collect::<Vec<_>>(), vec![("USE_SHADOWS", "1")]);
    }

    #[test]
    fn test_entry_points() {
        assert_eq!(ShaderStage::Task.entry_point(), "MainTS");
        assert_eq!(ShaderStage::Compute.flags(), vk::ShaderStageFlags::COMPUTE);
    }
}
