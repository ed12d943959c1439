use ash::vk;

/// Counters resolved from one pipeline statistics query, in this order
pub const PIPELINE_STATISTICS_COUNT: usize = 7;

pub const PIPELINE_STATISTICS_NAMES: [&str; PIPELINE_STATISTICS_COUNT] = [
    "Input assembly vertices",
    "Input assembly primitives",
    "Vertex shader invocations",
    "Clipping invocations",
    "Clipping primitives",
    "Fragment shader invocations",
    "Compute shader invocations",
];

pub fn pipeline_statistics_flags() -> vk::QueryPipelineStatisticFlags {
    vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_VERTICES
        | vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_PRIMITIVES
        | vk::QueryPipelineStatisticFlags::VERTEX_SHADER_INVOCATIONS
        | vk::QueryPipelineStatisticFlags::CLIPPING_INVOCATIONS
        | vk::QueryPipelineStatisticFlags::CLIPPING_PRIMITIVES
        | vk::QueryPipelineStatisticFlags::FRAGMENT_SHADER_INVOCATIONS
        | vk::QueryPipelineStatisticFlags::COMPUTE_SHADER_INVOCATIONS
}

/// Hands out timestamp queries from the current frame's pool
#[derive(Debug, Default)]
pub struct TimestampAllocator {
    pool: Option<vk::QueryPool>,
    next: u32,
    capacity: u32,
}

impl TimestampAllocator {
    /// `None` disables timestamps for the frame
    pub fn begin_frame(&mut self, pool: Option<vk::QueryPool>, capacity: u32) {
        self.pool = pool;
        self.next = 0;
        self.capacity = capacity;
    }

    pub fn allocate(&mut self) -> Option<(vk::QueryPool, u32)> {
        let pool = self.pool?;
        if self.next >= self.capacity {
            return None;
        }
        let query = self.next;
        self.next += 1;
        Some((pool, query))
    }

    pub fn used(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_allocator_stops_at_capacity() {
        let mut allocator = TimestampAllocator::default();
        assert!(allocator.allocate().is_none());

        let pool = vk::QueryPool::from_raw(7);
        allocator.begin_frame(Some(pool), 2);
        assert_eq!(allocator.allocate(), Some((pool, 0)));
        assert_eq!(allocator.allocate(), Some((pool, 1)));
        assert_eq!(allocator.allocate(), None);
        assert_eq!(allocator.used(), 2);

        allocator.begin_frame(Some(pool), 2);
        assert_eq!(allocator.used(), 0);
    }
}
