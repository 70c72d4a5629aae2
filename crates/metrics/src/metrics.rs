//! Common functions for metrics logging.
//!
//! We follow [Prometheus's conventions](https://prometheus.io/docs/practices/naming/) for metric
//! names:
//!
//! 1. Metrics may only contain alphanumerics and underscores.
//! 2. Metrics are automatically prefixed with `SERVICE_NAME`.
//! 3. Suffix metrics with their units (e.g. `_seconds`, `_bytes`, `_total`).
//!    See `ALLOWED_SUFFIXES` for more detail.
//!
//! Every crate keeps its metrics in a `metrics` module whose interface is high
//! level ("this transaction committed") rather than a raw `f64` logged to a
//! metric name.
use std::{
    borrow::Cow,
    collections::HashSet,
    ops::Deref,
    sync::LazyLock,
};

use parking_lot::RwLock;
use prometheus::Registry;

use crate::{
    log_counter_with_tags,
    metric_tag,
    register_txn_counter,
};

const ALLOWED_SUFFIXES: &[&str] = &[
    // Always use `_seconds` for time.
    "_seconds",
    // Always use `_bytes` for data lengths.
    "_bytes",
    // Store units.
    "_rows",
    "_keys",
    "_tables",
    "_indexes",
    "_chunks",
    "_transactions",
    "_commits",
    "_requests",
    "_retries",
    // Caching units.
    "_hits",
    "_misses",
    // General units.
    "_errors",
    "_reads",
    "_writes",
    "_waits",
    // Use `_total` as a generic unit-less count that doesn't fit into a unit above.
    "_total",
    // Use `_info` as a generic unit-less gauge that doesn't fit into a unit above.
    "_info",
];

/// Use executable name to identify service name
pub static SERVICE_NAME: LazyLock<String> = LazyLock::new(|| {
    let path = std::env::current_exe().expect("Couldn't find exe name");
    path.file_name()
        .expect("Path was empty")
        .to_str()
        .expect("Not valid unicode")
        .replace(['-', '.'], "_")
});

pub static TXN_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    Registry::new_custom(Some(SERVICE_NAME.clone()), None)
        .expect("Failed to initialize Prometheus metrics registry")
});

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MetricName(Cow<'static, str>);

impl MetricName {
    pub const fn new(name: &'static str) -> Self {
        validate_metric_name(name);
        Self(Cow::Borrowed(name))
    }
}

impl Deref for MetricName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0[..]
    }
}

const fn ends_with(s: &[u8], suffix: &[u8]) -> bool {
    if s.len() < suffix.len() {
        return false;
    }
    let s_base = s.len() - suffix.len();
    let mut i = 0;
    while i < suffix.len() {
        if s[s_base + i] != suffix[i] {
            return false;
        }
        i += 1;
    }
    true
}

const fn validate_metric_name(name: &str) {
    let name_bytes = name.as_bytes();

    let mut i = 0;
    while i < name_bytes.len() {
        let c = name_bytes[i];
        if !(c.is_ascii_alphanumeric() || c == b'_') {
            panic!("Metric names can only contain alphanumeric characters and underscores");
        }
        i += 1;
    }

    let mut i = 0;
    let mut found_suffix = false;
    while i < ALLOWED_SUFFIXES.len() {
        if ends_with(name_bytes, ALLOWED_SUFFIXES[i].as_bytes()) {
            found_suffix = true;
            break;
        }
        i += 1;
    }
    if !found_suffix {
        panic!(
            "Metric names must end with their units as a suffix (e.g. `_seconds`, `_bytes`, \
             `_total`)"
        );
    }
}

// Use a macro to force metric name validation to happen at compile time.
#[macro_export]
macro_rules! metric_name {
    ($name: expr) => {{
        use $crate::MetricName;
        const METRIC_NAME: MetricName = MetricName::new($name);
        METRIC_NAME
    }};
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetricHelp(&'static str);

impl MetricHelp {
    pub const fn new(help_str: &'static str) -> Self {
        if help_str.is_empty() {
            panic!("Metric help strings must be nonempty");
        }
        Self(help_str)
    }
}

impl Deref for MetricHelp {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

#[macro_export]
macro_rules! metric_help {
    ($help: literal) => {{
        use $crate::MetricHelp;
        const METRIC_HELP: MetricHelp = MetricHelp::new($help);
        METRIC_HELP
    }};
}

register_txn_counter!(
    INVALID_METRIC_TOTAL,
    "Count of metrics that failed to be reported",
    &["metric_name"]
);

// Only log a given metric failure once, since a bad metric is usually reported
// on a hot path.
static METRICS_ERROR_ONCE: LazyLock<RwLock<HashSet<String>>> = LazyLock::new(Default::default);
pub fn log_invalid_metric(name: String, error: prometheus::Error) {
    log_counter_with_tags(
        &INVALID_METRIC_TOTAL,
        1,
        vec![metric_tag(format!("metric_name:{name}"))],
    );
    if METRICS_ERROR_ONCE.read().contains(&name) {
        return;
    }
    if METRICS_ERROR_ONCE.write().insert(name.clone()) {
        let msg = format!("Failed to record metric {name:?}: {error}");
        if cfg!(any(test, feature = "testing")) {
            panic!("{msg}");
        }
        let err = anyhow::anyhow!(error).context(msg);
        tracing::error!("{:?}", err);
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        log_counter,
        log_distribution_with_tags,
        metric_tag_const_value,
        register_txn_counter,
        register_txn_histogram,
        MetricTag,
        StatusTimer,
        STATUS_LABEL,
        TXN_METRICS_REGISTRY,
    };

    register_txn_counter!(METRICS_TEST_WRITES_TOTAL, "Writes recorded by the metrics test");
    register_txn_histogram!(
        METRICS_TEST_COMMIT_SECONDS,
        "Commits recorded by the metrics test",
        &STATUS_LABEL
    );

    #[test]
    fn test_registered_metrics_are_gathered() {
        log_counter(&METRICS_TEST_WRITES_TOTAL, 3);
        assert_eq!(METRICS_TEST_WRITES_TOTAL.get(), 3);

        log_distribution_with_tags(
            &METRICS_TEST_COMMIT_SECONDS,
            0.5,
            vec![metric_tag_const_value("status", "conflict")],
        );
        StatusTimer::new(&METRICS_TEST_COMMIT_SECONDS).finish();
        drop(StatusTimer::new(&METRICS_TEST_COMMIT_SECONDS));

        let families = TXN_METRICS_REGISTRY.gather();
        let histogram = families
            .iter()
            .find(|f| f.get_name().ends_with("metrics_test_commit_seconds"))
            .expect("histogram not registered");
        // One series each for conflict, success and error.
        assert_eq!(histogram.get_metric().len(), 3);
        let statuses: Vec<_> = histogram
            .get_metric()
            .iter()
            .map(|m| m.get_label()[0].get_value().to_string())
            .collect();
        for status in [
            MetricTag::STATUS_SUCCESS,
            MetricTag::STATUS_ERROR,
            MetricTag::STATUS_CONFLICT,
        ] {
            assert!(statuses.contains(&status.split_key_value().1.to_string()));
        }
    }
}
