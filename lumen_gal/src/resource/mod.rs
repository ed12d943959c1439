pub mod arena;
pub mod buffer;
pub mod sampler;
pub mod texture;

pub use arena::{BufferHandle, Residency, Resources, TextureHandle};
pub use buffer::{Buffer, BufferCreateInfo};
pub use sampler::{SamplerCache, SamplerState};
pub use texture::{Texture, TextureCreateInfo, TextureDimension, ViewKey};
