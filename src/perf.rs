//! Process-wide timing and counter aggregation.
//!
//! Spans and counters are recorded with relaxed atomics and summarized once at
//! the end of a run (`aewave --verbose`). Nothing here affects numerics.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Duration,
    Counter,
}

/// Named metrics tracked by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Metric {
    GeometryInputRange,
    GeometryOutputRange,
    GeometryComputeInputs,
    ModelAssemble,
    ModelInitGeometry,
    EncoderForward,
    BottleneckForward,
    DecoderForward,
    ModelRun,
    CodebookInit,
    Kmeans,
    WavenetSample,
    CheckpointSave,
    CheckpointLoad,
    CodebookSamples,
    KmeansIterations,
    SampledSteps,
    BatchesRun,
}

impl Metric {
    const COUNT: usize = 18;

    const ALL: [Metric; Metric::COUNT] = [
        Metric::GeometryInputRange,
        Metric::GeometryOutputRange,
        Metric::GeometryComputeInputs,
        Metric::ModelAssemble,
        Metric::ModelInitGeometry,
        Metric::EncoderForward,
        Metric::BottleneckForward,
        Metric::DecoderForward,
        Metric::ModelRun,
        Metric::CodebookInit,
        Metric::Kmeans,
        Metric::WavenetSample,
        Metric::CheckpointSave,
        Metric::CheckpointLoad,
        Metric::CodebookSamples,
        Metric::KmeansIterations,
        Metric::SampledSteps,
        Metric::BatchesRun,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Dotted name used in reports.
    pub fn name(self) -> &'static str {
        match self {
            Metric::GeometryInputRange => "geometry.input_range",
            Metric::GeometryOutputRange => "geometry.output_range",
            Metric::GeometryComputeInputs => "geometry.compute_inputs",
            Metric::ModelAssemble => "model.assemble",
            Metric::ModelInitGeometry => "model.init_geometry",
            Metric::EncoderForward => "encoder.forward",
            Metric::BottleneckForward => "bottleneck.forward",
            Metric::DecoderForward => "decoder.forward",
            Metric::ModelRun => "model.run",
            Metric::CodebookInit => "codebook.init",
            Metric::Kmeans => "codebook.kmeans",
            Metric::WavenetSample => "wavenet.sample",
            Metric::CheckpointSave => "checkpoint.save",
            Metric::CheckpointLoad => "checkpoint.load",
            Metric::CodebookSamples => "codebook.samples",
            Metric::KmeansIterations => "codebook.kmeans_iterations",
            Metric::SampledSteps => "wavenet.sampled_steps",
            Metric::BatchesRun => "model.batches",
        }
    }

    fn kind(self) -> MetricKind {
        match self {
            Metric::CodebookSamples
            | Metric::KmeansIterations
            | Metric::SampledSteps
            | Metric::BatchesRun => MetricKind::Counter,
            _ => MetricKind::Duration,
        }
    }
}

struct PerfCollector {
    start: Instant,
    totals_us: [AtomicU64; Metric::COUNT],
    counts: [AtomicU64; Metric::COUNT],
}

impl PerfCollector {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            totals_us: std::array::from_fn(|_| AtomicU64::new(0)),
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn add_duration(&self, metric: Metric, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let index = metric.index();
        self.totals_us[index].fetch_add(micros, Ordering::Relaxed);
        self.counts[index].fetch_add(1, Ordering::Relaxed);
    }

    fn add_count(&self, metric: Metric, delta: u64) {
        self.counts[metric.index()].fetch_add(delta, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            uptime: self.start.elapsed(),
            totals_us: std::array::from_fn(|idx| self.totals_us[idx].load(Ordering::Relaxed)),
            counts: std::array::from_fn(|idx| self.counts[idx].load(Ordering::Relaxed)),
        }
    }
}

static COLLECTOR: OnceLock<PerfCollector> = OnceLock::new();

fn collector() -> &'static PerfCollector {
    COLLECTOR.get_or_init(PerfCollector::new)
}

/// RAII timer that records its duration when dropped.
pub struct PerfSpan {
    metric: Metric,
    start: Instant,
}

impl Drop for PerfSpan {
    fn drop(&mut self) {
        collector().add_duration(self.metric, self.start.elapsed());
    }
}

/// Begin a named timing span.
pub fn span(metric: Metric) -> PerfSpan {
    PerfSpan {
        metric,
        start: Instant::now(),
    }
}

/// Record a counter delta.
pub fn add_count(metric: Metric, delta: u64) {
    collector().add_count(metric, delta);
}

/// Current value of a counter (or number of recorded spans for a duration).
pub fn count(metric: Metric) -> u64 {
    collector().counts[metric.index()].load(Ordering::Relaxed)
}

/// Snapshot of collected performance data.
#[derive(Debug)]
pub struct PerfSnapshot {
    uptime: Duration,
    totals_us: [u64; Metric::COUNT],
    counts: [u64; Metric::COUNT],
}

impl PerfSnapshot {
    /// Format a human-readable report, longest durations first.
    pub fn format(&self) -> String {
        let mut durations: Vec<(Metric, u64, u64)> = Vec::new();
        let mut counters: Vec<(Metric, u64)> = Vec::new();
        for metric in Metric::ALL {
            let idx = metric.index();
            let (total_us, count) = (self.totals_us[idx], self.counts[idx]);
            match metric.kind() {
                MetricKind::Duration if count > 0 || total_us > 0 => {
                    durations.push((metric, total_us, count))
                }
                MetricKind::Counter if count > 0 => counters.push((metric, count)),
                _ => {}
            }
        }
        durations.sort_by(|a, b| b.1.cmp(&a.1));
        counters.sort_by(|a, b| b.1.cmp(&a.1));

        let mut output = String::new();
        let _ = writeln!(
            output,
            "Performance summary (uptime: {:.3}s)",
            self.uptime.as_secs_f64()
        );
        if durations.is_empty() && counters.is_empty() {
            let _ = writeln!(output, "No performance data recorded.");
            return output;
        }
        if !durations.is_empty() {
            let _ = writeln!(output, "Durations:");
            let _ = writeln!(
                output,
                "  {:<30} {:>10} {:>8} {:>10}",
                "name", "total", "count", "avg"
            );
            for (metric, total_us, count) in durations {
                let avg_ms = if count == 0 {
                    0.0
                } else {
                    total_us as f64 / count as f64 / 1000.0
                };
                let _ = writeln!(
                    output,
                    "  {:<30} {:>10.3}s {:>8} {:>10.3}ms",
                    metric.name(),
                    total_us as f64 / 1_000_000.0,
                    count,
                    avg_ms
                );
            }
        }
        if !counters.is_empty() {
            let _ = writeln!(output, "Counters:");
            for (metric, value) in counters {
                let _ = writeln!(output, "  {:<30} {}", metric.name(), value);
            }
        }
        output
    }
}

/// Format a report of everything collected so far.
pub fn report() -> String {
    collector().snapshot().format()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_table_is_consistent() {
        for (idx, metric) in Metric::ALL.iter().enumerate() {
            assert_eq!(metric.index(), idx);
        }
    }

    #[test]
    fn spans_and_counters_show_up_in_report() {
        {
            let _span = span(Metric::CheckpointSave);
        }
        add_count(Metric::SampledSteps, 3);
        assert!(count(Metric::SampledSteps) >= 3);
        let report = report();
        assert!(report.contains("checkpoint.save"));
        assert!(report.contains("wavenet.sampled_steps"));
    }
}
