//! A local drain to accumulate the metrics of one thread
//!
//! The metrics are stored in a map of metric name to aggregated value:
//!
//! ```plain
//! LocalDrain {
//!     metrics: MetricsMap {
//!         map: BTreeMap<metric_name, AggregatedMetric>
//!     },
//! }
//! ```
//!
//! Time metrics are kept as histograms and dumped both as percentiles and
//! as a bucketed histogram.

use std::{collections::BTreeMap, time::Instant};

use hdrhistogram::Histogram;

use crate::metrics::{MetricError, MetricValue};

/// metrics as stored in the local drain
#[derive(Debug, Clone)]
pub enum AggregatedMetric {
    Gauge(usize),
    Count(i64),
    Time(Histogram<u32>),
}

impl AggregatedMetric {
    fn new(metric: MetricValue) -> Result<AggregatedMetric, MetricError> {
        match metric {
            MetricValue::Gauge(value) => Ok(AggregatedMetric::Gauge(value)),
            MetricValue::GaugeAdd(value) => Ok(AggregatedMetric::Gauge(value.max(0) as usize)),
            MetricValue::Count(value) => Ok(AggregatedMetric::Count(value)),
            MetricValue::Time(value) => {
                let mut histogram = ::hdrhistogram::Histogram::new(3).map_err(|error| {
                    MetricError::HistogramCreation {
                        time_metric: metric,
                        error: error.to_string(),
                    }
                })?;

                histogram.record(value as u64).map_err(|error| {
                    MetricError::TimeMetricRecordingError {
                        time_metric: metric,
                        error: error.to_string(),
                    }
                })?;

                Ok(AggregatedMetric::Time(histogram))
            }
        }
    }

    fn update(&mut self, key: &str, metric: MetricValue) -> Result<(), MetricError> {
        match (self, metric) {
            (&mut AggregatedMetric::Gauge(ref mut v1), MetricValue::Gauge(v2)) => {
                *v1 = v2;
            }
            (&mut AggregatedMetric::Gauge(ref mut v1), MetricValue::GaugeAdd(v2)) => {
                *v1 = (*v1 as i64 + v2).max(0) as usize;
            }
            (&mut AggregatedMetric::Count(ref mut v1), MetricValue::Count(v2)) => {
                *v1 += v2;
            }
            (&mut AggregatedMetric::Time(ref mut v1), MetricValue::Time(v2)) => {
                v1.record(v2 as u64)
                    .map_err(|error| MetricError::TimeMetricRecordingError {
                        time_metric: metric,
                        error: error.to_string(),
                    })?;
            }
            (_, metric) => {
                return Err(MetricError::IncompatibleUpdate {
                    key: key.to_owned(),
                    metric,
                })
            }
        }
        Ok(())
    }

    pub fn to_filtered(&self) -> FilteredMetric {
        match *self {
            AggregatedMetric::Gauge(i) => FilteredMetric::Gauge(i as u64),
            AggregatedMetric::Count(i) => FilteredMetric::Count(i),
            AggregatedMetric::Time(ref hist) => {
                FilteredMetric::Percentiles(histogram_to_percentiles(hist))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Percentiles {
    pub samples: u64,
    pub p_50: u64,
    pub p_90: u64,
    pub p_99: u64,
    pub p_99_9: u64,
    pub p_100: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    /// upper bound of the bucket
    pub le: u64,
    pub count: u64,
}

/// metric values as handed out of the drain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilteredMetric {
    Gauge(u64),
    Count(i64),
    Percentiles(Percentiles),
    Histogram {
        sum: u64,
        count: u64,
        buckets: Vec<Bucket>,
    },
}

impl std::fmt::Display for FilteredMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilteredMetric::Gauge(value) => write!(f, "{value}"),
            FilteredMetric::Count(value) => write!(f, "{value}"),
            FilteredMetric::Percentiles(p) => write!(
                f,
                "samples={} p50={} p90={} p99={} p99.9={} p100={}",
                p.samples, p.p_50, p.p_90, p.p_99, p.p_99_9, p.p_100
            ),
            FilteredMetric::Histogram { sum, count, .. } => write!(f, "sum={sum} count={count}"),
        }
    }
}

pub fn histogram_to_percentiles(hist: &Histogram<u32>) -> Percentiles {
    Percentiles {
        samples: hist.len(),
        p_50: hist.value_at_percentile(50.0),
        p_90: hist.value_at_percentile(90.0),
        p_99: hist.value_at_percentile(99.0),
        p_99_9: hist.value_at_percentile(99.9),
        p_100: hist.value_at_percentile(100.0),
    }
}

/// convert a collected histogram to cumulative buckets
pub fn filter_histogram(hist: &Histogram<u32>) -> FilteredMetric {
    let count = hist.len();
    let mean = hist.mean();
    let min = hist.min();
    let max = hist.max();
    let sum = (count as f64 * mean) as u64;
    let range = max - min;
    let number_of_buckets = 10;
    let mut buckets = Vec::new();

    for i in 1..=number_of_buckets {
        let le = min + (i * range) / number_of_buckets;
        let count = hist.count_between(min, le);
        buckets.push(Bucket { le, count });
    }
    FilteredMetric::Histogram {
        sum,
        count,
        buckets,
    }
}

/// a map of metric_name -> metric value
#[derive(Debug, Clone, Default)]
pub struct MetricsMap {
    map: BTreeMap<String, AggregatedMetric>,
}

impl MetricsMap {
    fn receive(&mut self, metric_name: &str, metric: MetricValue) -> Result<(), MetricError> {
        match self.map.get_mut(metric_name) {
            Some(stored_metric) => stored_metric.update(metric_name, metric),
            None => {
                let aggregated_metric = AggregatedMetric::new(metric)?;
                self.map.insert(metric_name.to_owned(), aggregated_metric);
                Ok(())
            }
        }
    }

    /// time metrics appear twice: as percentiles, and as a histogram
    /// under `<name>_hist`
    fn to_filtered_metrics(&self, filter_by_names: &[String]) -> BTreeMap<String, FilteredMetric> {
        let mut filtered_metrics = BTreeMap::new();
        for (name, metric) in self.map.iter() {
            if !filter_by_names.is_empty() && !filter_by_names.contains(name) {
                continue;
            }

            filtered_metrics.insert(name.to_owned(), metric.to_filtered());
            if let AggregatedMetric::Time(ref hist) = metric {
                filtered_metrics.insert(format!("{name}_hist"), filter_histogram(hist));
            }
        }
        filtered_metrics
    }
}

/// This gathers the metrics of one thread
#[derive(Debug)]
pub struct LocalDrain {
    /// a prefix to metric keys, usually "burrow"
    pub prefix: String,
    pub created: Instant,
    metrics: MetricsMap,
}

impl LocalDrain {
    pub fn new(prefix: String) -> Self {
        LocalDrain {
            prefix,
            created: Instant::now(),
            metrics: MetricsMap::default(),
        }
    }

    pub fn receive_metric(&mut self, key: &str, metric: MetricValue) {
        trace!("receiving metric with key {}, metric data: {:?}", key, metric);

        if let Err(e) = self.metrics.receive(key, metric) {
            error!("Could not receive metric: {}", e);
        }
    }

    /// every metric if `metric_names` is empty, only those named otherwise
    pub fn dump(&self, metric_names: &[String]) -> BTreeMap<String, FilteredMetric> {
        self.metrics.to_filtered_metrics(metric_names)
    }

    pub fn query(&self, metric_name: &str) -> Result<FilteredMetric, MetricError> {
        self.metrics
            .map
            .get(metric_name)
            .map(AggregatedMetric::to_filtered)
            .ok_or_else(|| MetricError::NoMetrics(metric_name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_and_yield_counts() {
        let mut local_drain = LocalDrain::new("prefix".to_string());

        local_drain.receive_metric("client.closed", MetricValue::Count(1));
        local_drain.receive_metric("client.closed", MetricValue::Count(1));

        assert_eq!(
            local_drain
                .query("client.closed")
                .expect("could not query metric"),
            FilteredMetric::Count(2)
        );
        assert!(matches!(
            local_drain.query("client.accepted"),
            Err(MetricError::NoMetrics(_))
        ));
    }

    #[test]
    fn incompatible_update_is_ignored() {
        let mut local_drain = LocalDrain::new("prefix".to_string());
        local_drain.receive_metric("client.active", MetricValue::Gauge(3));
        local_drain.receive_metric("client.active", MetricValue::Count(1));

        assert_eq!(
            local_drain.query("client.active").unwrap(),
            FilteredMetric::Gauge(3)
        );
    }

    #[test]
    fn gauge_never_goes_negative() {
        let mut local_drain = LocalDrain::new("prefix".to_string());
        local_drain.receive_metric("client.active", MetricValue::GaugeAdd(1));
        local_drain.receive_metric("client.active", MetricValue::GaugeAdd(-3));

        assert_eq!(
            local_drain.query("client.active").unwrap(),
            FilteredMetric::Gauge(0)
        );
    }

    #[test]
    fn dump_time_metrics_with_histogram() {
        let mut local_drain = LocalDrain::new("prefix".to_string());
        for value in [10, 20, 30, 40] {
            local_drain.receive_metric("client.duration", MetricValue::Time(value));
        }
        local_drain.receive_metric("bytes_out", MetricValue::Count(7));

        let dump = local_drain.dump(&["client.duration".to_string()]);
        assert_eq!(dump.len(), 2);

        match dump.get("client.duration_hist") {
            Some(FilteredMetric::Histogram { count, buckets, .. }) => {
                assert_eq!(*count, 4);
                assert_eq!(buckets.len(), 10);
                assert_eq!(buckets.last().map(|bucket| bucket.count), Some(4));
            }
            other => panic!("unexpected histogram {other:?}"),
        }
        assert_eq!(local_drain.dump(&[]).len(), 3);
    }
}
