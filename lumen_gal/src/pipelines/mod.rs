pub use cache::{ComputePipelineCache, GraphicsPipelineCache};
pub use graphics::*;

pub mod cache;
pub mod graphics;

/// Stable identifier of a cached graphics pipeline. Survives shader hot reloads.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphicsPipelineId(pub(crate) u32);

/// Stable identifier of a cached compute pipeline. Survives shader hot reloads.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComputePipelineId(pub(crate) u32);
