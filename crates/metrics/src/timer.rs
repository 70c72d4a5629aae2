use std::{
    collections::BTreeSet,
    mem,
    time::{
        Duration,
        Instant,
    },
};

use prometheus::{
    Histogram,
    HistogramVec,
};

use crate::{
    get_desc,
    log_distribution,
    log_distribution_with_tags,
    metric_tag_const_value,
    tags::MetricTag,
};

/// Records the time between construction and drop into a histogram.
pub struct Timer {
    start: Instant,
    histogram: &'static Histogram,
}

impl Timer {
    pub fn new(histogram: &'static Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed = self.start.elapsed();
        tracing::debug!("{elapsed:?} for timer {:?}", get_desc(self.histogram));
        log_distribution(self.histogram, elapsed.as_secs_f64());
    }
}

/// Status timer that defaults to error unless `.finish()` is explicitly called
/// upon success.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    tags: BTreeSet<MetricTag>,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        let mut tags = BTreeSet::new();
        tags.insert(MetricTag::STATUS_ERROR);
        Self {
            start: Instant::now(),
            histogram,
            tags,
        }
    }

    fn replace_status(&mut self, status: MetricTag) {
        self.tags.remove(&MetricTag::STATUS_ERROR);
        self.tags.insert(status);
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish the timer with status success
    pub fn finish(mut self) -> Duration {
        self.replace_status(MetricTag::STATUS_SUCCESS);
        self.elapsed()
    }

    /// Finish the timer with the given status, e.g. `"conflict"`.
    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.replace_status(metric_tag_const_value("status", status));
        self.elapsed()
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed = self.start.elapsed();
        tracing::debug!(
            "{elapsed:?} for timer {:?} {:?}",
            get_desc(self.histogram),
            self.tags
        );
        let tags = mem::take(&mut self.tags);
        log_distribution_with_tags(
            self.histogram,
            elapsed.as_secs_f64(),
            tags.into_iter().collect(),
        );
    }
}
