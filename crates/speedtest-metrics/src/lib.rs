//! Prometheus-style metric model, registry and text exposition.
//!
//! Two kinds of metrics live in a [`MetricsRegistry`]: long-lived
//! instruments (counters, gauges, histograms) updated by the process
//! itself, and [`Collector`]s that produce fresh samples on every scrape.

pub mod collector;
pub mod exposition;
pub mod registry;
pub mod types;

pub use collector::{Collector, Sample, SampleSender};
pub use registry::{CounterMetric, GaugeMetric, HistogramMetric, MetricsRegistry};
pub use types::{CollectedMetric, MetricDescriptor, MetricSample, MetricType, MetricValue, fq_name};
