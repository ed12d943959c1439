//! GPU timing zones and pipeline statistics resolved from a retired frame.

use lumen_gal::command::TimestampMark;
use lumen_gal::query::{PIPELINE_STATISTICS_COUNT, PIPELINE_STATISTICS_NAMES};
use tracing::error;

/// A named span of GPU time
#[derive(Debug, Clone, PartialEq)]
pub struct GpuZone {
    pub name: String,
    /// Nesting level, 0 for outermost zones
    pub depth: u32,
    pub ms: f64,
}

/// Pairs begin and end marks into zones, in begin order.
///
/// `marks` must be in submission order across streams. `ticks` is indexed by
/// query and `period` is nanoseconds per tick.
pub fn resolve_zones(marks: &[TimestampMark], ticks: &[u64], period: f32) -> Vec<GpuZone> {
    let mut zones = Vec::new();
    let mut open: Vec<(usize, u64)> = Vec::new();
    for mark in marks {
        let Some(tick) = ticks.get(mark.query as usize).copied() else {
            error!(query = mark.query, "Timestamp query outside the resolved range");
            continue;
        };
        match &mark.name {
            Some(name) => {
                open.push((zones.len(), tick));
                zones.push(GpuZone {
                    name: name.clone(),
                    depth: (open.len() - 1) as u32,
                    ms: 0.0,
                });
            }
            None => match open.pop() {
                Some((index, begin)) => {
                    zones[index].ms = tick.saturating_sub(begin) as f64 * period as f64 / 1e6;
                }
                None => error!(query = mark.query, "Zone end without a matching begin"),
            },
        }
    }
    if !open.is_empty() {
        error!(unclosed = open.len(), "Frame ended with open GPU zones");
        let unclosed: Vec<usize> = open.into_iter().map(|(index, _)| index).collect();
        let mut index = 0;
        zones.retain(|_| {
            let keep = !unclosed.contains(&index);
            index += 1;
            keep
        });
    }
    zones
}

/// Pipeline statistics summed over every stream of a frame
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PipelineStatistics {
    pub input_assembly_vertices: u64,
    pub input_assembly_primitives: u64,
    pub vertex_shader_invocations: u64,
    pub clipping_invocations: u64,
    pub clipping_primitives: u64,
    pub fragment_shader_invocations: u64,
    pub compute_shader_invocations: u64,
}

impl PipelineStatistics {
    fn as_array(&self) -> [u64; PIPELINE_STATISTICS_COUNT] {
        [
            self.input_assembly_vertices,
            self.input_assembly_primitives,
            self.vertex_shader_invocations,
            self.clipping_invocations,
            self.clipping_primitives,
            self.fragment_shader_invocations,
            self.compute_shader_invocations,
        ]
    }

    /// Adds one query's worth of values
    pub fn accumulate(&mut self, values: &[u64]) {
        let fields = [
            &mut self.input_assembly_vertices,
            &mut self.input_assembly_primitives,
            &mut self.vertex_shader_invocations,
            &mut self.clipping_invocations,
            &mut self.clipping_primitives,
            &mut self.fragment_shader_invocations,
            &mut self.compute_shader_invocations,
        ];
        for (field, value) in fields.into_iter().zip(values) {
            *field += value;
        }
    }

    /// Counter names paired with their values
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> {
        PIPELINE_STATISTICS_NAMES.into_iter().zip(self.as_array())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin(name: &str, query: u32) -> TimestampMark {
        TimestampMark {
            name: Some(name.to_string()),
            query,
        }
    }

    fn end(query: u32) -> TimestampMark {
        TimestampMark { name: None, query }
    }

    #[test]
    fn test_nested_zones_keep_begin_order() {
        let marks = [begin("Frame", 0), begin("Shadows", 1), end(2), end(3)];
        let ticks = [0, 1_000_000, 3_000_000, 4_000_000];
        let zones = resolve_zones(&marks, &ticks, 1.0);
        assert_eq!(
            zones,
            vec![
                GpuZone {
                    name: "Frame".to_string(),
                    depth: 0,
                    ms: 4.0,
                },
                GpuZone {
                    name: "Shadows".to_string(),
                    depth: 1,
                    ms: 2.0,
                },
            ]
        );
    }

    #[test]
    fn test_period_scales_ticks() {
        let zones = resolve_zones(&[begin("Blit", 0), end(1)], &[10, 20], 500_000.0);
        assert_eq!(zones[0].ms, 5.0);
    }

    #[test]
    fn test_unclosed_zone_is_dropped() {
        let marks = [begin("Open", 0), begin("Closed", 1), end(2)];
        let zones = resolve_zones(&marks, &[0, 5, 9], 1.0);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].name, "Closed");
        assert_eq!(zones[0].depth, 1);
    }

    #[test]
    fn test_statistics_accumulate_and_name() {
        let mut statistics = PipelineStatistics::default();
        statistics.accumulate(&[3, 1, 3, 1, 1, 1, 0]);
        statistics.accumulate(&[0, 0, 0, 0, 0, 0, 8]);
        assert_eq!(statistics.vertex_shader_invocations, 3);
        assert_eq!(statistics.compute_shader_invocations, 8);
        let named: Vec<_> = statistics.iter().collect();
        assert_eq!(named[0], ("Input assembly vertices", 3));
        assert_eq!(named[6], ("Compute shader invocations", 8));
    }
}
