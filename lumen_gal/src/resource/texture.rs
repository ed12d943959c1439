use std::collections::HashMap;

use anyhow::Result;
use ash::vk;
#[cfg(feature = "log-lifetimes")]
use tracing::trace;

use super::Residency;
use crate::descriptor::{DescriptorKind, DescriptorTable};
use crate::device::{DescriptorInfo, Device, RawImageInfo, RawViewInfo, ViewKind};
use crate::usage::TextureUsage;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D1,
    D2,
}

#[derive(Debug, Clone)]
pub struct TextureCreateInfo {
    pub usage: TextureUsage,
    pub format: vk::Format,
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    /// Allocate a full mip chain
    pub mips: bool,
    pub name: Option<String>,
}

impl TextureCreateInfo {
    pub fn texture_1d(
        usage: TextureUsage,
        format: vk::Format,
        width: u32,
        layers: u32,
        mips: bool,
    ) -> Self {
        Self {
            usage,
            format,
            dimension: TextureDimension::D1,
            width,
            height: 1,
            layers,
            mips,
            name: None,
        }
    }

    pub fn texture_2d(
        usage: TextureUsage,
        format: vk::Format,
        width: u32,
        height: u32,
        layers: u32,
        mips: bool,
    ) -> Self {
        Self {
            usage,
            format,
            dimension: TextureDimension::D2,
            width,
            height,
            layers,
            mips,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Identity of a cached image view
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ViewKey {
    pub base_layer: u32,
    pub layer_count: u32,
    pub base_mip: u32,
    pub mip_count: u32,
    pub kind: ViewKind,
}

/// `floor(log2(max(width, height))) + 1`
pub fn full_mip_count(width: u32, height: u32) -> u32 {
    let largest = width.max(height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Bytes per texel of an uncompressed color or depth format, `None` for block
/// compressed or otherwise unknown formats
pub fn texel_size(format: vk::Format) -> Option<u64> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::R8_SRGB => 1,
        vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM
        | vk::Format::R8G8_SNORM
        | vk::Format::R8G8_UINT
        | vk::Format::R16_UNORM
        | vk::Format::R16_UINT
        | vk::Format::R16_SFLOAT
        | vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SNORM
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::E5B9G9R9_UFLOAT_PACK32
        | vk::Format::R16G16_UNORM
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::R32_SFLOAT
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::X8_D24_UNORM_PACK32 => 4,
        vk::Format::R16G16B16A16_UNORM
        | vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R32G32_UINT
        | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32_SFLOAT => 12,
        vk::Format::R32G32B32A32_UINT | vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

pub fn format_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

#[derive(Debug)]
pub struct Texture {
    image: vk::Image,
    format: vk::Format,
    dimension: TextureDimension,
    extent: vk::Extent2D,
    layers: u32,
    mips: u32,
    usage: TextureUsage,
    aspect: vk::ImageAspectFlags,
    name: Option<String>,
    /// State left behind by the last reconciled stream
    pub(crate) state: TextureUsage,
    views: HashMap<ViewKey, vk::ImageView>,
    srv: Option<u32>,
    uav: Option<u32>,
    uav_layers: Vec<(u32, u32)>,
    /// Owned elsewhere, e.g. a swapchain image
    imported: bool,
    pub(crate) residency: Residency,
}

impl Texture {
    pub(crate) fn new<D: Device>(device: &mut D, info: TextureCreateInfo) -> Result<Self> {
        let mips = if info.mips {
            full_mip_count(info.width, info.height)
        } else {
            1
        };
        let cube_compatible = info.dimension == TextureDimension::D2
            && info.layers == 6
            && info.width == info.height;
        let image = device.create_image(&RawImageInfo {
            image_type: match info.dimension {
                TextureDimension::D1 => vk::ImageType::TYPE_1D,
                TextureDimension::D2 => vk::ImageType::TYPE_2D,
            },
            format: info.format,
            extent: vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: 1,
            },
            mip_levels: mips,
            array_layers: info.layers,
            usage: info.usage.into(),
            cube_compatible,
            name: info.name.as_deref(),
        })?;
        #[cfg(feature = "log-lifetimes")]
        trace!("Creating texture {:?} ({:?})", image, info.name);
        Ok(Self {
            image,
            format: info.format,
            dimension: info.dimension,
            extent: vk::Extent2D {
                width: info.width,
                height: info.height,
            },
            layers: info.layers,
            mips,
            usage: info.usage,
            aspect: format_aspect(info.format),
            name: info.name,
            state: TextureUsage::empty(),
            views: HashMap::new(),
            srv: None,
            uav: None,
            uav_layers: Vec::new(),
            imported: false,
            residency: Residency::default(),
        })
    }

    /// Wraps an image whose memory is owned by someone else
    pub(crate) fn import(
        image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: TextureUsage,
        name: Option<String>,
    ) -> Self {
        Self {
            image,
            format,
            dimension: TextureDimension::D2,
            extent,
            layers: 1,
            mips: 1,
            usage,
            aspect: format_aspect(format),
            name,
            state: TextureUsage::empty(),
            views: HashMap::new(),
            srv: None,
            uav: None,
            uav_layers: Vec::new(),
            imported: true,
            residency: Residency::default(),
        }
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn mips(&self) -> u32 {
        self.mips
    }

    pub fn usage(&self) -> TextureUsage {
        self.usage
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> TextureUsage {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TextureUsage) {
        self.state = state;
    }

    pub fn is_imported(&self) -> bool {
        self.imported
    }

    pub fn residency(&self) -> &Residency {
        &self.residency
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    fn layered_kind(&self, layer_count: u32) -> ViewKind {
        match (self.dimension, layer_count > 1) {
            (TextureDimension::D1, false) => ViewKind::D1,
            (TextureDimension::D1, true) => ViewKind::D1Array,
            (TextureDimension::D2, false) => ViewKind::D2,
            (TextureDimension::D2, true) => ViewKind::D2Array,
        }
    }

    /// View used when the texture is bound to the descriptor table.
    ///
    /// All six layers of a six layer texture are exposed as a cube.
    pub fn descriptor_view_key(
        &self,
        base_layer: u32,
        layer_count: u32,
        base_mip: u32,
        mip_count: u32,
    ) -> ViewKey {
        let kind = if base_layer == 0 && layer_count == 6 && self.layers == 6 {
            ViewKind::Cube
        } else {
            self.layered_kind(layer_count)
        };
        ViewKey {
            base_layer,
            layer_count,
            base_mip,
            mip_count,
            kind,
        }
    }

    /// Single layer, single mip view used as an attachment
    pub fn target_view_key(&self, layer: u32) -> ViewKey {
        ViewKey {
            base_layer: layer,
            layer_count: 1,
            base_mip: 0,
            mip_count: 1,
            kind: self.layered_kind(1),
        }
    }

    pub(crate) fn view<D: Device>(&mut self, device: &mut D, key: ViewKey) -> Result<vk::ImageView> {
        if let Some(view) = self.views.get(&key) {
            return Ok(*view);
        }
        let view = device.create_image_view(&RawViewInfo {
            image: self.image,
            format: self.format,
            kind: key.kind,
            aspect: self.aspect,
            base_mip: key.base_mip,
            mip_count: key.mip_count,
            base_layer: key.base_layer,
            layer_count: key.layer_count,
        })?;
        self.views.insert(key, view);
        Ok(view)
    }

    pub(crate) fn bind_srv<D: Device>(
        &mut self,
        device: &mut D,
        descriptors: &mut DescriptorTable,
    ) -> Result<u32> {
        assert!(
            self.usage.contains(TextureUsage::SAMPLE),
            "Texture {:?} bound as SRV without SAMPLE usage",
            self.name
        );
        if let Some(slot) = self.srv {
            return Ok(slot);
        }
        let key = self.descriptor_view_key(0, self.layers, 0, self.mips);
        let view = self.view(device, key)?;
        let bytes = device.descriptor_bytes(&DescriptorInfo::SampledImage(view))?;
        let slot = descriptors.acquire(DescriptorKind::SampledImage, bytes);
        self.srv = Some(slot);
        Ok(slot)
    }

    pub(crate) fn bind_uav<D: Device>(
        &mut self,
        device: &mut D,
        descriptors: &mut DescriptorTable,
    ) -> Result<u32> {
        self.assert_storage();
        if let Some(slot) = self.uav {
            return Ok(slot);
        }
        let key = self.descriptor_view_key(0, self.layers, 0, 1);
        let view = self.view(device, key)?;
        let bytes = device.descriptor_bytes(&DescriptorInfo::StorageImage(view))?;
        let slot = descriptors.acquire(DescriptorKind::StorageImage, bytes);
        self.uav = Some(slot);
        Ok(slot)
    }

    /// Storage view of a single layer, e.g. one cubemap face
    pub(crate) fn bind_uav_layer<D: Device>(
        &mut self,
        device: &mut D,
        descriptors: &mut DescriptorTable,
        layer: u32,
    ) -> Result<u32> {
        self.assert_storage();
        assert!(
            layer < self.layers,
            "Layer {layer} out of range for texture {:?} with {} layers",
            self.name,
            self.layers
        );
        if self.layers == 1 {
            return self.bind_uav(device, descriptors);
        }
        if let Some((_, slot)) = self.uav_layers.iter().find(|(bound, _)| *bound == layer) {
            return Ok(*slot);
        }
        let key = ViewKey {
            base_layer: layer,
            layer_count: 1,
            base_mip: 0,
            mip_count: 1,
            kind: self.layered_kind(1),
        };
        let view = self.view(device, key)?;
        let bytes = device.descriptor_bytes(&DescriptorInfo::StorageImage(view))?;
        let slot = descriptors.acquire(DescriptorKind::StorageImage, bytes);
        self.uav_layers.push((layer, slot));
        Ok(slot)
    }

    fn assert_storage(&self) {
        assert!(
            self.usage.contains(TextureUsage::STORAGE),
            "Texture {:?} bound as UAV without STORAGE usage",
            self.name
        );
    }

    pub(crate) fn destroy<D: Device>(&mut self, device: &mut D, descriptors: &mut DescriptorTable) {
        if let Some(slot) = self.srv.take() {
            descriptors.release(DescriptorKind::SampledImage, slot);
        }
        if let Some(slot) = self.uav.take() {
            descriptors.release(DescriptorKind::StorageImage, slot);
        }
        for (_, slot) in self.uav_layers.drain(..) {
            descriptors.release(DescriptorKind::StorageImage, slot);
        }
        for (_, view) in self.views.drain() {
            device.destroy_image_view(view);
        }
        if !self.imported {
            #[cfg(feature = "log-lifetimes")]
            trace!("Destroying texture {:?} ({:?})", self.image, self.name);
            device.destroy_image(self.image);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::headless_context;

    #[test]
    fn test_full_mip_count() {
        assert_eq!(full_mip_count(1, 1), 1);
        assert_eq!(full_mip_count(256, 256), 9);
        assert_eq!(full_mip_count(300, 17), 9);
        assert_eq!(full_mip_count(1024, 2048), 12);
    }

    #[test]
    fn test_depth_formats_use_depth_aspect() {
        assert_eq!(
            format_aspect(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert!(format_aspect(vk::Format::D24_UNORM_S8_UINT).contains(vk::ImageAspectFlags::STENCIL));
        assert_eq!(
            format_aspect(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn test_srv_is_memoized() {
        let mut ctx = headless_context();
        let texture = ctx
            .create_texture(TextureCreateInfo::texture_2d(
                TextureUsage::SAMPLE,
                vk::Format::R8G8B8A8_UNORM,
                64,
                64,
                1,
                true,
            ))
            .unwrap();
        let first = ctx.bind_texture_srv(texture).unwrap();
        let second = ctx.bind_texture_srv(texture).unwrap();
        assert_eq!(first, second);
        assert_eq!(ctx.descriptors.pending_writes(), 1);
        assert_eq!(ctx.texture(texture).view_count(), 1);
        assert_eq!(ctx.texture(texture).mips(), 7);
    }

    #[test]
    fn test_cube_view_for_six_layers() {
        let mut ctx = headless_context();
        let cube = ctx
            .create_texture(TextureCreateInfo::texture_2d(
                TextureUsage::SAMPLE | TextureUsage::STORAGE,
                vk::Format::R16G16B16A16_SFLOAT,
                32,
                32,
                6,
                false,
            ))
            .unwrap();
        let texture = ctx.texture(cube);
        assert_eq!(texture.descriptor_view_key(0, 6, 0, 1).kind, ViewKind::Cube);
        assert_eq!(texture.descriptor_view_key(1, 5, 0, 1).kind, ViewKind::D2Array);
        assert_eq!(texture.target_view_key(3).kind, ViewKind::D2);
    }

    #[test]
    fn test_uav_layers_get_distinct_slots() {
        let mut ctx = headless_context();
        let cube = ctx
            .create_texture(TextureCreateInfo::texture_2d(
                TextureUsage::STORAGE,
                vk::Format::R16G16B16A16_SFLOAT,
                32,
                32,
                6,
                false,
            ))
            .unwrap();
        let face0 = ctx.bind_texture_uav_layer(cube, 0).unwrap();
        let face1 = ctx.bind_texture_uav_layer(cube, 1).unwrap();
        assert_ne!(face0, face1);
        assert_eq!(ctx.bind_texture_uav_layer(cube, 0).unwrap(), face0);
    }

    #[test]
    fn test_single_layer_uav_layer_falls_back() {
        let mut ctx = headless_context();
        let texture = ctx
            .create_texture(TextureCreateInfo::texture_2d(
                TextureUsage::STORAGE,
                vk::Format::R8G8B8A8_UNORM,
                16,
                16,
                1,
                false,
            ))
            .unwrap();
        let layer = ctx.bind_texture_uav_layer(texture, 0).unwrap();
        assert_eq!(ctx.bind_texture_uav(texture).unwrap(), layer);
    }

    #[test]
    #[should_panic(expected = "without SAMPLE")]
    fn test_srv_without_sample_usage_panics() {
        let mut ctx = headless_context();
        let texture = ctx
            .create_texture(TextureCreateInfo::texture_2d(
                TextureUsage::STORAGE,
                vk::Format::R8G8B8A8_UNORM,
                16,
                16,
                1,
                false,
            ))
            .unwrap();
        let _ = ctx.bind_texture_srv(texture);
    }

    #[test]
    fn test_destroy_releases_slots_and_views() {
        let mut ctx = headless_context();
        let live = ctx.device().live_objects();
        let texture = ctx
            .create_texture(TextureCreateInfo::texture_2d(
                TextureUsage::SAMPLE | TextureUsage::STORAGE,
                vk::Format::R8G8B8A8_UNORM,
                16,
                16,
                1,
                false,
            ))
            .unwrap();
        ctx.bind_texture_srv(texture).unwrap();
        ctx.bind_texture_uav(texture).unwrap();
        ctx.destroy_texture(texture);
        assert_eq!(ctx.descriptors.allocated(DescriptorKind::SampledImage), 0);
        assert_eq!(ctx.descriptors.allocated(DescriptorKind::StorageImage), 0);
        assert_eq!(ctx.device().live_objects(), live);
        assert!(ctx.resources.try_texture(texture).is_none());
    }
}
