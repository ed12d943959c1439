use std::ops::{Deref, DerefMut};

use lumen_gal::command::CommandStream;
use lumen_gal::device::Device;
use lumen_gal::GpuContext;
#[cfg(feature = "log-lifetimes")]
use tracing::trace;

/// A stream on loan from a [`StreamPool`].
///
/// Must be handed back to the driver, either submitted or released.
#[derive(Debug)]
pub struct PooledStream {
    index: usize,
    stream: CommandStream,
}

impl PooledStream {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Deref for PooledStream {
    type Target = CommandStream;

    fn deref(&self) -> &Self::Target {
        &self.stream
    }
}

impl DerefMut for PooledStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.stream
    }
}

#[derive(Debug)]
struct PoolEntry {
    /// `None` while on loan
    stream: Option<CommandStream>,
    /// Submitted and not yet retired
    in_flight: bool,
}

/// Streams shared by every frame of the ring.
///
/// A stream is reusable once it is back in the pool and either was never
/// submitted or has retired.
#[derive(Debug, Default)]
pub struct StreamPool {
    entries: Vec<PoolEntry>,
}

impl StreamPool {
    /// Hands out a reusable stream in [`lumen_gal::command::StreamState::Initial`], if any
    pub fn take_free(&mut self, name: Option<&str>) -> Option<PooledStream> {
        let (index, entry) = self
            .entries
            .iter_mut()
            .enumerate()
            .find(|(_, entry)| entry.stream.is_some() && !entry.in_flight)?;
        let mut stream = entry.stream.take()?;
        stream.set_name(name);
        Some(PooledStream { index, stream })
    }

    /// Grows the pool by one stream, already on loan
    pub fn create(&mut self, name: Option<&str>) -> PooledStream {
        let index = self.entries.len();
        #[cfg(feature = "log-lifetimes")]
        trace!("Growing stream pool to {} streams", index + 1);
        self.entries.push(PoolEntry {
            stream: None,
            in_flight: false,
        });
        PooledStream {
            index,
            stream: CommandStream::new(name),
        }
    }

    /// Takes back a stream that was submitted
    pub fn return_submitted(&mut self, stream: PooledStream) {
        let entry = &mut self.entries[stream.index];
        entry.stream = Some(stream.stream);
        entry.in_flight = true;
    }

    /// Takes back a stream that was never submitted
    pub fn release<D: Device>(&mut self, ctx: &mut GpuContext<D>, mut stream: PooledStream) {
        stream.stream.reset(ctx);
        let entry = &mut self.entries[stream.index];
        entry.stream = Some(stream.stream);
        entry.in_flight = false;
    }

    pub fn stream(&self, index: usize) -> Option<&CommandStream> {
        self.entries.get(index).and_then(|entry| entry.stream.as_ref())
    }

    /// Resets a submitted stream whose work has completed
    pub fn retire<D: Device>(&mut self, ctx: &mut GpuContext<D>, index: usize) {
        let Some(entry) = self.entries.get_mut(index) else {
            return;
        };
        if !entry.in_flight {
            return;
        }
        if let Some(stream) = entry.stream.as_mut() {
            stream.reset(ctx);
        }
        entry.in_flight = false;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Streams currently on loan
    pub fn on_loan(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.stream.is_none())
            .count()
    }

    /// Destroys every stream in the pool. Streams on loan are leaked.
    pub fn destroy<D: Device>(&mut self, ctx: &mut GpuContext<D>) {
        for entry in self.entries.drain(..) {
            if let Some(mut stream) = entry.stream {
                stream.destroy(ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::headless_context;
    use lumen_gal::command::StreamState;

    #[test]
    fn test_free_streams_are_reused() {
        let mut ctx = headless_context();
        let mut pool = StreamPool::default();
        assert!(pool.take_free(None).is_none());

        let stream = pool.create(Some("First"));
        assert_eq!(pool.on_loan(), 1);
        pool.release(&mut ctx, stream);

        let again = pool.take_free(Some("Second")).unwrap();
        assert_eq!(again.index(), 0);
        assert_eq!(again.name(), Some("Second"));
        assert_eq!(pool.len(), 1);
        pool.release(&mut ctx, again);
        pool.destroy(&mut ctx);
    }

    #[test]
    fn test_in_flight_streams_wait_for_retirement() {
        let mut ctx = headless_context();
        let mut pool = StreamPool::default();
        let mut stream = pool.create(None);
        stream.begin(&mut ctx).unwrap();
        stream.end().unwrap();
        stream.mark_submitted(&mut ctx);
        pool.return_submitted(stream);
        assert!(pool.take_free(None).is_none());

        pool.retire(&mut ctx, 0);
        let reused = pool.take_free(None).unwrap();
        assert_eq!(reused.state(), StreamState::Initial);
        pool.release(&mut ctx, reused);
        pool.destroy(&mut ctx);
    }
}
