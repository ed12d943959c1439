pub mod command;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod pipelines;
pub mod prelude;
pub mod query;
pub mod resource;
pub mod shader;
pub mod traits;
pub mod usage;

pub use context::{GpuContext, GpuContextConfiguration};
pub use error::GalError;

// Re-exports
pub use ash;
#[cfg(feature = "vulkan")]
pub use gpu_allocator;
