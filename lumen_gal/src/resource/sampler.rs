use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use anyhow::Result;
use ash::vk;
#[cfg(feature = "log-lifetimes")]
use tracing::trace;

use crate::descriptor::{DescriptorKind, DescriptorTable};
use crate::device::{DescriptorInfo, Device};

/// Full sampler description, used as the cache key
#[derive(Debug, Copy, Clone)]
pub struct SamplerState {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_u: vk::SamplerAddressMode,
    pub address_v: vk::SamplerAddressMode,
    pub address_w: vk::SamplerAddressMode,
    pub mip_lod_bias: f32,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
}

impl Default for SamplerState {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_u: vk::SamplerAddressMode::REPEAT,
            address_v: vk::SamplerAddressMode::REPEAT,
            address_w: vk::SamplerAddressMode::REPEAT,
            mip_lod_bias: 0.0,
            anisotropy_enable: false,
            max_anisotropy: 1.0,
            min_lod: 0.0,
            max_lod: 1000.0,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        }
    }
}

impl SamplerState {
    pub fn nearest() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            ..Default::default()
        }
    }

    pub fn linear() -> Self {
        Self {
            address_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            ..Default::default()
        }
    }

    pub fn linear_anisotropy() -> Self {
        Self {
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            anisotropy_enable: true,
            max_anisotropy: 16.0,
            ..Default::default()
        }
    }

    pub fn with_address_mode(mut self, mode: vk::SamplerAddressMode) -> Self {
        self.address_u = mode;
        self.address_v = mode;
        self.address_w = mode;
        self
    }

    fn key(&self) -> impl Eq + Hash {
        (
            (self.mag_filter, self.min_filter, self.mipmap_mode),
            (self.address_u, self.address_v, self.address_w),
            self.mip_lod_bias.to_bits(),
            self.anisotropy_enable,
            self.max_anisotropy.to_bits(),
            (self.min_lod.to_bits(), self.max_lod.to_bits()),
            self.border_color,
        )
    }
}

impl PartialEq for SamplerState {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for SamplerState {}

impl Hash for SamplerState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

#[derive(Debug, Copy, Clone)]
struct CachedSampler {
    sampler: vk::Sampler,
    slot: u32,
}

/// Creates each distinct sampler once and keeps its descriptor slot
#[derive(Debug, Default)]
pub struct SamplerCache {
    samplers: HashMap<SamplerState, CachedSampler>,
}

impl SamplerCache {
    pub fn get<D: Device>(
        &mut self,
        device: &mut D,
        descriptors: &mut DescriptorTable,
        state: &SamplerState,
    ) -> Result<u32> {
        if let Some(cached) = self.samplers.get(state) {
            return Ok(cached.slot);
        }
        let sampler = device.create_sampler(state)?;
        #[cfg(feature = "log-lifetimes")]
        trace!("Creating VkSampler {:?}", sampler);
        let bytes = device.descriptor_bytes(&DescriptorInfo::Sampler(sampler))?;
        let slot = descriptors.acquire(DescriptorKind::Sampler, bytes);
        self.samplers.insert(*state, CachedSampler { sampler, slot });
        Ok(slot)
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    pub fn destroy<D: Device>(&mut self, device: &mut D, descriptors: &mut DescriptorTable) {
        for (_, cached) in self.samplers.drain() {
            descriptors.release(DescriptorKind::Sampler, cached.slot);
            device.destroy_sampler(cached.sampler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::headless_context;

    #[test]
    fn test_presets_differ() {
        assert_ne!(SamplerState::nearest(), SamplerState::linear());
        assert_ne!(SamplerState::linear(), SamplerState::linear_anisotropy());
        assert_eq!(SamplerState::linear_anisotropy().max_anisotropy, 16.0);
    }

    #[test]
    fn test_identical_states_share_a_sampler() {
        let mut ctx = headless_context();
        let a = ctx.sampler(&SamplerState::linear()).unwrap();
        let b = ctx.sampler(&SamplerState::linear()).unwrap();
        let c = ctx.sampler(&SamplerState::nearest()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ctx.samplers.len(), 2);
    }
}
