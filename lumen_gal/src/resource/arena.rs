use lumen_containers::prelude::{Slot, SlotMap};

use super::{Buffer, Texture};

pub type BufferHandle = Slot<Buffer>;
pub type TextureHandle = Slot<Texture>;

/// How many command streams still reference a resource.
///
/// A resource may only be freed once both counts are zero.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Residency {
    /// Streams that touched the resource and have not been submitted
    pub recording: u32,
    /// Submitted streams that have not been retired yet
    pub pending: u32,
    /// Destruction was requested while still pending
    pub doomed: bool,
}

impl Residency {
    pub fn in_use(&self) -> bool {
        self.recording > 0 || self.pending > 0
    }

    pub(crate) fn submit(&mut self) {
        debug_assert!(self.recording > 0);
        self.recording -= 1;
        self.pending += 1;
    }

    pub(crate) fn release(&mut self, submitted: bool) {
        if submitted {
            debug_assert!(self.pending > 0);
            self.pending -= 1;
        } else {
            debug_assert!(self.recording > 0);
            self.recording -= 1;
        }
    }
}

/// Generation checked storage of every buffer and texture
#[derive(Debug, Default)]
pub struct Resources {
    buffers: SlotMap<Buffer>,
    textures: SlotMap<Texture>,
}

impl Resources {
    pub(crate) fn insert_buffer(&mut self, buffer: Buffer) -> BufferHandle {
        self.buffers.insert(buffer)
    }

    pub(crate) fn insert_texture(&mut self, texture: Texture) -> TextureHandle {
        self.textures.insert(texture)
    }

    pub fn try_buffer(&self, handle: BufferHandle) -> Option<&Buffer> {
        self.buffers.get(handle)
    }

    pub fn try_texture(&self, handle: TextureHandle) -> Option<&Texture> {
        self.textures.get(handle)
    }

    /// # Panics
    /// On a stale handle
    pub fn buffer(&self, handle: BufferHandle) -> &Buffer {
        self.buffers
            .get(handle)
            .unwrap_or_else(|| panic!("Stale buffer handle {handle:?}"))
    }

    /// # Panics
    /// On a stale handle
    pub fn texture(&self, handle: TextureHandle) -> &Texture {
        self.textures
            .get(handle)
            .unwrap_or_else(|| panic!("Stale texture handle {handle:?}"))
    }

    pub(crate) fn buffer_mut(&mut self, handle: BufferHandle) -> &mut Buffer {
        self.buffers
            .get_mut(handle)
            .unwrap_or_else(|| panic!("Stale buffer handle {handle:?}"))
    }

    pub(crate) fn texture_mut(&mut self, handle: TextureHandle) -> &mut Texture {
        self.textures
            .get_mut(handle)
            .unwrap_or_else(|| panic!("Stale texture handle {handle:?}"))
    }

    pub(crate) fn try_buffer_mut(&mut self, handle: BufferHandle) -> Option<&mut Buffer> {
        self.buffers.get_mut(handle)
    }

    pub(crate) fn try_texture_mut(&mut self, handle: TextureHandle) -> Option<&mut Texture> {
        self.textures.get_mut(handle)
    }

    pub(crate) fn remove_buffer(&mut self, handle: BufferHandle) -> Option<Buffer> {
        self.buffers.remove(handle).ok()
    }

    pub(crate) fn remove_texture(&mut self, handle: TextureHandle) -> Option<Texture> {
        self.textures.remove(handle).ok()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Removes doomed resources that no stream references anymore
    pub(crate) fn take_collectable(&mut self) -> (Vec<Buffer>, Vec<Texture>) {
        let buffers: Vec<BufferHandle> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| buffer.residency.doomed && !buffer.residency.in_use())
            .map(|(handle, _)| handle)
            .collect();
        let textures: Vec<TextureHandle> = self
            .textures
            .iter()
            .filter(|(_, texture)| texture.residency.doomed && !texture.residency.in_use())
            .map(|(handle, _)| handle)
            .collect();
        (
            buffers
                .into_iter()
                .filter_map(|handle| self.remove_buffer(handle))
                .collect(),
            textures
                .into_iter()
                .filter_map(|handle| self.remove_texture(handle))
                .collect(),
        )
    }

    /// Drains every resource, used on shutdown
    pub(crate) fn take_all(&mut self) -> (Vec<Buffer>, Vec<Texture>) {
        let buffers = self.buffers.slots();
        let textures = self.textures.slots();
        (
            buffers
                .into_iter()
                .filter_map(|handle| self.remove_buffer(handle))
                .collect(),
            textures
                .into_iter()
                .filter_map(|handle| self.remove_texture(handle))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_residency_moves_from_recording_to_pending() {
        let mut residency = Residency::default();
        residency.recording += 1;
        assert!(residency.in_use());
        residency.submit();
        assert_eq!(residency.recording, 0);
        assert_eq!(residency.pending, 1);
        residency.release(true);
        assert!(!residency.in_use());
    }
}
