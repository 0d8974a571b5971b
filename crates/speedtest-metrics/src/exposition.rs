//! Prometheus text exposition format, version 0.0.4.

use crate::types::{CollectedMetric, MetricValue};

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn render(metrics: &[CollectedMetric]) -> String {
    let mut output = String::new();

    for metric in metrics {
        let name = &metric.descriptor.name;

        output.push_str("# HELP ");
        output.push_str(name);
        output.push(' ');
        output.push_str(&escape_help(&metric.descriptor.help));
        output.push('\n');

        output.push_str("# TYPE ");
        output.push_str(name);
        output.push(' ');
        output.push_str(metric.descriptor.metric_type.as_prometheus_type());
        output.push('\n');

        for sample in &metric.samples {
            match &sample.value {
                MetricValue::Counter(value) | MetricValue::Gauge(value) => {
                    push_sample_line(&mut output, name, &sample.labels, *value);
                }
                MetricValue::Histogram {
                    buckets,
                    count,
                    sum,
                } => {
                    let bucket_name = format!("{name}_bucket");
                    let mut cumulative = 0_u64;
                    for (bound, bucket_count) in buckets {
                        cumulative = cumulative.saturating_add(*bucket_count);
                        let mut labels = sample.labels.clone();
                        labels.push(("le".to_string(), format_metric_value(*bound)));
                        push_sample_line(&mut output, &bucket_name, &labels, cumulative as f64);
                    }

                    push_sample_line(&mut output, &format!("{name}_sum"), &sample.labels, *sum);
                    push_sample_line(
                        &mut output,
                        &format!("{name}_count"),
                        &sample.labels,
                        *count as f64,
                    );
                }
            }
        }
    }

    output
}

fn push_sample_line(output: &mut String, name: &str, labels: &[(String, String)], value: f64) {
    output.push_str(name);

    if !labels.is_empty() {
        output.push('{');
        for (index, (key, label_value)) in labels.iter().enumerate() {
            if index > 0 {
                output.push(',');
            }
            output.push_str(key);
            output.push_str("=\"");
            output.push_str(&escape_label_value(label_value));
            output.push('"');
        }
        output.push('}');
    }

    output.push(' ');
    output.push_str(&format_metric_value(value));
    output.push('\n');
}

fn format_metric_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

fn escape_help(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}
