use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::future::join_all;
use speedtest_common::error::{Result, SpeedtestError};
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    collector::Collector,
    exposition,
    types::{CollectedMetric, MetricDescriptor, MetricSample, MetricType, MetricValue},
};

type LabelValues = Vec<String>;

trait RegisteredMetric: Send + Sync {
    fn descriptor(&self) -> &MetricDescriptor;
    fn collect(&self) -> Vec<MetricSample>;
}

/// Process-wide registry, built once at startup and handed to the HTTP
/// layer by reference.
pub struct MetricsRegistry {
    // Lock order: `collectors` before `metrics`.
    metrics: RwLock<HashMap<String, Arc<dyn RegisteredMetric>>>,
    collectors: RwLock<Vec<Arc<dyn Collector>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            collectors: RwLock::new(Vec::new()),
        }
    }

    pub fn register_counter(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
    ) -> Result<Arc<CounterMetric>> {
        let metric = Arc::new(CounterMetric {
            descriptor: MetricDescriptor::new(name, help, MetricType::Counter, variable_labels),
            series: SeriesFamily::new(),
        });
        self.register_metric(metric.clone())?;
        Ok(metric)
    }

    pub fn register_gauge(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
    ) -> Result<Arc<GaugeMetric>> {
        let metric = Arc::new(GaugeMetric {
            descriptor: MetricDescriptor::new(name, help, MetricType::Gauge, variable_labels),
            series: SeriesFamily::new(),
        });
        self.register_metric(metric.clone())?;
        Ok(metric)
    }

    pub fn register_histogram(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
        buckets: &[f64],
    ) -> Result<Arc<HistogramMetric>> {
        let mut sorted_buckets = buckets.to_vec();
        sorted_buckets.sort_by(|left, right| left.total_cmp(right));
        sorted_buckets.dedup();

        let metric = Arc::new(HistogramMetric {
            descriptor: MetricDescriptor::new(name, help, MetricType::Histogram, variable_labels),
            buckets: sorted_buckets,
            series: SeriesFamily::new(),
        });
        self.register_metric(metric.clone())?;
        Ok(metric)
    }

    /// Registers a scrape-time collector. Its descriptors must not clash
    /// with anything already registered.
    pub fn register_collector(&self, collector: Arc<dyn Collector>) -> Result<()> {
        let described = collector.describe();
        let mut names = HashSet::new();
        for descriptor in &described {
            if !names.insert(descriptor.name.clone()) {
                return Err(SpeedtestError::InvalidArgument(format!(
                    "collector describes metric twice: {}",
                    descriptor.name
                )));
            }
        }

        let mut collectors = self.collectors.write().map_err(|_| lock_poisoned())?;
        let metrics = self.metrics.read().map_err(|_| lock_poisoned())?;

        let taken = collectors
            .iter()
            .flat_map(|existing| existing.describe())
            .map(|descriptor| descriptor.name.clone())
            .chain(metrics.keys().cloned())
            .collect::<HashSet<_>>();

        if let Some(clash) = names.iter().find(|name| taken.contains(*name)) {
            return Err(SpeedtestError::InvalidArgument(format!(
                "metric already registered: {clash}"
            )));
        }

        collectors.push(collector);
        Ok(())
    }

    /// Runs every collector concurrently and merges their samples with the
    /// registry's own instruments. Families without samples are omitted.
    pub async fn gather(&self) -> Vec<CollectedMetric> {
        let collectors = match self.collectors.read() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        };

        let (sink, mut samples) = mpsc::unbounded_channel();
        join_all(collectors.iter().map(|collector| collector.collect(&sink))).await;
        drop(sink);

        let mut families: BTreeMap<String, CollectedMetric> = BTreeMap::new();

        if let Ok(metrics) = self.metrics.read() {
            for metric in metrics.values() {
                let descriptor = metric.descriptor();
                families.insert(
                    descriptor.name.clone(),
                    CollectedMetric {
                        descriptor: descriptor.clone(),
                        samples: metric.collect(),
                    },
                );
            }
        }

        while let Ok(sample) = samples.try_recv() {
            let name = sample.descriptor().name.clone();
            let family = families.entry(name).or_insert_with(|| CollectedMetric {
                descriptor: sample.descriptor().as_ref().clone(),
                samples: Vec::new(),
            });
            if family.descriptor != **sample.descriptor() {
                warn!(
                    metric = %family.descriptor.name,
                    "dropping sample with conflicting descriptor"
                );
                continue;
            }
            family.samples.push(sample.into_metric_sample());
        }

        families
            .into_values()
            .filter(|family| !family.samples.is_empty())
            .map(|mut family| {
                family.samples.sort_by(|left, right| left.labels.cmp(&right.labels));
                family
            })
            .collect()
    }

    pub async fn render_prometheus(&self) -> String {
        exposition::render(&self.gather().await)
    }

    fn register_metric<M: RegisteredMetric + 'static>(&self, metric: Arc<M>) -> Result<()> {
        let name = metric.descriptor().name.clone();
        let collectors = self.collectors.read().map_err(|_| lock_poisoned())?;
        let mut metrics = self.metrics.write().map_err(|_| lock_poisoned())?;

        let described_by_collector = collectors
            .iter()
            .flat_map(|collector| collector.describe())
            .any(|descriptor| descriptor.name == name);

        if metrics.contains_key(&name) || described_by_collector {
            return Err(SpeedtestError::InvalidArgument(format!(
                "metric already registered: {name}"
            )));
        }

        metrics.insert(name, metric);
        Ok(())
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_poisoned() -> SpeedtestError {
    SpeedtestError::InternalError("failed to acquire metrics registry lock".to_string())
}

/// Label-keyed series storage shared by every instrument kind.
struct SeriesFamily<T> {
    series: RwLock<HashMap<LabelValues, Arc<T>>>,
}

impl<T> SeriesFamily<T> {
    fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, label_values: LabelValues, init: impl FnOnce() -> T) -> Arc<T> {
        if let Ok(guard) = self.series.read()
            && let Some(existing) = guard.get(&label_values)
        {
            return existing.clone();
        }

        match self.series.write() {
            Ok(mut guard) => guard
                .entry(label_values)
                .or_insert_with(|| Arc::new(init()))
                .clone(),
            Err(_) => Arc::new(init()),
        }
    }

    fn get(&self, label_values: &LabelValues) -> Option<Arc<T>> {
        self.series.read().ok()?.get(label_values).cloned()
    }

    fn snapshot(&self) -> Vec<(LabelValues, Arc<T>)> {
        match self.series.read() {
            Ok(guard) => guard
                .iter()
                .map(|(labels, series)| (labels.clone(), series.clone()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

pub struct CounterMetric {
    descriptor: MetricDescriptor,
    series: SeriesFamily<AtomicU64>,
}

impl CounterMetric {
    pub fn inc(&self, labels: &[&str], value: u64) {
        self.series
            .get_or_create(normalize_labels(&self.descriptor, labels), || AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc_one(&self, labels: &[&str]) {
        self.inc(labels, 1);
    }

    pub fn get(&self, labels: &[&str]) -> u64 {
        self.series
            .get(&normalize_labels(&self.descriptor, labels))
            .map_or(0, |value| value.load(Ordering::Relaxed))
    }
}

impl RegisteredMetric for CounterMetric {
    fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    fn collect(&self) -> Vec<MetricSample> {
        self.series
            .snapshot()
            .into_iter()
            .map(|(label_values, value)| MetricSample {
                labels: materialize_labels(&self.descriptor, &label_values),
                value: MetricValue::Counter(value.load(Ordering::Relaxed) as f64),
            })
            .collect()
    }
}

/// Gauge holding an `f64`, stored as raw bits.
pub struct GaugeMetric {
    descriptor: MetricDescriptor,
    series: SeriesFamily<AtomicU64>,
}

impl GaugeMetric {
    pub fn set(&self, labels: &[&str], value: f64) {
        self.series
            .get_or_create(normalize_labels(&self.descriptor, labels), || {
                AtomicU64::new(0.0_f64.to_bits())
            })
            .store(value.to_bits(), Ordering::Relaxed);
    }
}

impl RegisteredMetric for GaugeMetric {
    fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    fn collect(&self) -> Vec<MetricSample> {
        self.series
            .snapshot()
            .into_iter()
            .map(|(label_values, bits)| MetricSample {
                labels: materialize_labels(&self.descriptor, &label_values),
                value: MetricValue::Gauge(f64::from_bits(bits.load(Ordering::Relaxed))),
            })
            .collect()
    }
}

pub struct HistogramMetric {
    descriptor: MetricDescriptor,
    buckets: Vec<f64>,
    series: SeriesFamily<HistogramSeries>,
}

struct HistogramSeries {
    bucket_counts: Vec<AtomicU64>,
    count: AtomicU64,
    sum: Mutex<f64>,
}

impl HistogramSeries {
    fn new(bucket_len: usize) -> Self {
        Self {
            bucket_counts: (0..bucket_len + 1).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum: Mutex::new(0.0),
        }
    }
}

impl HistogramMetric {
    pub fn observe(&self, labels: &[&str], value: f64) {
        let bucket_len = self.buckets.len();
        let series = self
            .series
            .get_or_create(normalize_labels(&self.descriptor, labels), || {
                HistogramSeries::new(bucket_len)
            });

        let bucket_index = self
            .buckets
            .iter()
            .position(|bucket| value <= *bucket)
            .unwrap_or(bucket_len);

        if let Some(bucket) = series.bucket_counts.get(bucket_index) {
            bucket.fetch_add(1, Ordering::Relaxed);
        }

        series.count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut sum) = series.sum.lock() {
            *sum += value;
        }
    }
}

impl RegisteredMetric for HistogramMetric {
    fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    fn collect(&self) -> Vec<MetricSample> {
        self.series
            .snapshot()
            .into_iter()
            .map(|(label_values, entry)| {
                let buckets = self
                    .buckets
                    .iter()
                    .copied()
                    .chain(std::iter::once(f64::INFINITY))
                    .zip(entry.bucket_counts.iter())
                    .map(|(bound, count)| (bound, count.load(Ordering::Relaxed)))
                    .collect();

                let sum = match entry.sum.lock() {
                    Ok(value) => *value,
                    Err(_) => 0.0,
                };

                MetricSample {
                    labels: materialize_labels(&self.descriptor, &label_values),
                    value: MetricValue::Histogram {
                        buckets,
                        count: entry.count.load(Ordering::Relaxed),
                        sum,
                    },
                }
            })
            .collect()
    }
}

fn normalize_labels(descriptor: &MetricDescriptor, labels: &[&str]) -> LabelValues {
    (0..descriptor.variable_labels.len())
        .map(|index| labels.get(index).copied().unwrap_or_default().to_string())
        .collect()
}

fn materialize_labels(descriptor: &MetricDescriptor, values: &[String]) -> Vec<(String, String)> {
    descriptor
        .variable_labels
        .iter()
        .zip(values.iter())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
