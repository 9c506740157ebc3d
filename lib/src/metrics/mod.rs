//! Per-worker metrics
//!
//! Each thread owns a [`LocalDrain`] in a thread local. The macros of this
//! module feed it without any synchronisation, and a worker hands its
//! aggregated values over when its thread ends.

pub mod local_drain;

use std::{cell::RefCell, collections::BTreeMap};

pub use crate::metrics::local_drain::{FilteredMetric, LocalDrain, Percentiles};

thread_local! {
    pub static METRICS: RefCell<LocalDrain> = RefCell::new(LocalDrain::new(String::from("burrow")));
}

#[derive(thiserror::Error, Debug)]
pub enum MetricError {
    #[error("could not create histogram for time metric {time_metric:?}: {error}")]
    HistogramCreation {
        time_metric: MetricValue,
        error: String,
    },
    #[error("could not record time metric {time_metric:?}: {error}")]
    TimeMetricRecordingError {
        time_metric: MetricValue,
        error: String,
    },
    #[error("metric {key} cannot be updated with {metric:?}")]
    IncompatibleUpdate { key: String, metric: MetricValue },
    #[error("no metric named {0}")]
    NoMetrics(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricValue {
    Gauge(usize),
    GaugeAdd(i64),
    Count(i64),
    Time(usize),
}

/// a snapshot of every metric of the current thread
pub fn dump_local_metrics() -> BTreeMap<String, FilteredMetric> {
    METRICS.with(|metrics| metrics.borrow().dump(&[]))
}

#[macro_export]
macro_rules! count (
    ($key:expr, $value: expr) => ({
        let v = $value;
        $crate::metrics::METRICS.with(|metrics| {
            (*metrics.borrow_mut()).receive_metric($key, $crate::metrics::MetricValue::Count(v));
        });
    })
);

#[macro_export]
macro_rules! incr (
    ($key:expr) => (count!($key, 1));
);

#[macro_export]
macro_rules! decr (
    ($key:expr) => (count!($key, -1));
);

#[macro_export]
macro_rules! gauge (
    ($key:expr, $value: expr) => ({
        let v = $value;
        $crate::metrics::METRICS.with(|metrics| {
            (*metrics.borrow_mut()).receive_metric($key, $crate::metrics::MetricValue::Gauge(v as usize));
        });
    })
);

#[macro_export]
macro_rules! gauge_add (
    ($key:expr, $value: expr) => ({
        let v = $value;
        $crate::metrics::METRICS.with(|metrics| {
            (*metrics.borrow_mut()).receive_metric($key, $crate::metrics::MetricValue::GaugeAdd(v as i64));
        });
    })
);

/// records a duration in milliseconds
#[macro_export]
macro_rules! time (
    ($key:expr, $value: expr) => ({
        let v = $value;
        $crate::metrics::METRICS.with(|metrics| {
            (*metrics.borrow_mut()).receive_metric($key, $crate::metrics::MetricValue::Time(v as usize));
        });
    })
);
