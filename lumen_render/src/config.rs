use lumen_gal::descriptor::DescriptorCapacities;
use lumen_gal::GpuContextConfiguration;

#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfiguration {
    /// Depth of the frame ring
    pub frames_in_flight: usize,
    pub descriptor_capacities: DescriptorCapacities,
    /// Size of each frame's timestamp pool. Zones past it are dropped.
    pub timestamp_queries_per_frame: u32,
    pub gpu_profiling: bool,
    /// Only takes effect if the device supports it
    pub pipeline_statistics: bool,
}

impl Default for RendererConfiguration {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            descriptor_capacities: DescriptorCapacities::default(),
            timestamp_queries_per_frame: 512,
            gpu_profiling: true,
            pipeline_statistics: true,
        }
    }
}

impl RendererConfiguration {
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_descriptor_capacities(mut self, capacities: DescriptorCapacities) -> Self {
        self.descriptor_capacities = capacities;
        self
    }

    pub fn with_timestamp_queries_per_frame(mut self, queries: u32) -> Self {
        self.timestamp_queries_per_frame = queries;
        self
    }

    pub fn with_gpu_profiling(mut self, enabled: bool) -> Self {
        self.gpu_profiling = enabled;
        self
    }

    pub fn with_pipeline_statistics(mut self, enabled: bool) -> Self {
        self.pipeline_statistics = enabled;
        self
    }

    /// Settings the [`lumen_gal::GpuContext`] should be created with
    pub fn context_configuration(&self) -> GpuContextConfiguration {
        GpuContextConfiguration::default()
            .with_descriptor_capacities(self.descriptor_capacities)
            .with_pipeline_statistics(self.pipeline_statistics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RendererConfiguration::default();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.timestamp_queries_per_frame, 512);
        assert!(config.gpu_profiling);
        assert!(config.pipeline_statistics);
    }

    #[test]
    fn test_context_configuration_follows_renderer_settings() {
        let config = RendererConfiguration::default().with_pipeline_statistics(false);
        let context = config.context_configuration();
        assert!(!context.pipeline_statistics);
        assert_eq!(context.descriptor_capacities, config.descriptor_capacities);
    }
}
