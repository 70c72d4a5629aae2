//! Code for interacting with our metrics logging
mod macros;
mod metrics;
mod reporting;
mod tags;
mod timer;

pub use crate::{
    macros::*,
    metrics::*,
    reporting::{
        get_desc,
        log_counter,
        log_counter_with_tags,
        log_distribution,
        log_distribution_with_tags,
        log_gauge,
    },
    tags::{
        metric_tag,
        metric_tag_const_value,
        MetricTag,
        Tags,
        STATUS_LABEL,
    },
    timer::{
        StatusTimer,
        Timer,
    },
};
