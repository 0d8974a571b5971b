use std::sync::Arc;

use async_trait::async_trait;
use speedtest_common::error::{Result, SpeedtestError};
use tokio::sync::mpsc;

use crate::types::{MetricDescriptor, MetricSample, MetricType, MetricValue};

pub type SampleSender = mpsc::UnboundedSender<Sample>;

/// A unit that produces samples on demand, once per scrape.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Every descriptor this collector may ever emit samples for.
    fn describe(&self) -> Vec<Arc<MetricDescriptor>>;

    /// Pushes this cycle's samples into `sink`. Failures are handled
    /// inside the collector; a cycle may legitimately emit nothing.
    async fn collect(&self, sink: &SampleSender);
}

/// An immutable point-in-time sample bound to its descriptor.
#[derive(Debug, Clone)]
pub struct Sample {
    descriptor: Arc<MetricDescriptor>,
    value: f64,
    label_values: Vec<String>,
}

impl Sample {
    pub fn new_const(
        descriptor: Arc<MetricDescriptor>,
        value: f64,
        label_values: Vec<String>,
    ) -> Result<Self> {
        if descriptor.metric_type == MetricType::Histogram {
            return Err(SpeedtestError::InvalidArgument(format!(
                "const samples cannot be histograms: {}",
                descriptor.name
            )));
        }

        if label_values.len() != descriptor.variable_labels.len() {
            return Err(SpeedtestError::InvalidArgument(format!(
                "metric {} expects {} label values, got {}",
                descriptor.name,
                descriptor.variable_labels.len(),
                label_values.len()
            )));
        }

        Ok(Self {
            descriptor,
            value,
            label_values,
        })
    }

    pub fn descriptor(&self) -> &Arc<MetricDescriptor> {
        &self.descriptor
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn label_values(&self) -> &[String] {
        &self.label_values
    }

    pub(crate) fn into_metric_sample(self) -> MetricSample {
        let labels = self
            .descriptor
            .variable_labels
            .iter()
            .cloned()
            .zip(self.label_values)
            .collect();
        let value = match self.descriptor.metric_type {
            MetricType::Counter => MetricValue::Counter(self.value),
            _ => MetricValue::Gauge(self.value),
        };

        MetricSample { labels, value }
    }
}
