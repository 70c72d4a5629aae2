use std::{
    borrow::Cow,
    ops::Deref,
};

pub type Tags = Vec<MetricTag>;

/// A `key:value` pair that becomes a prometheus label when the metric is
/// reported. A tag without a `:` reports as `key="true"`.
#[derive(PartialOrd, Ord, PartialEq, Eq, Clone, Debug, derive_more::Display)]
pub struct MetricTag(Cow<'static, str>);

impl Deref for MetricTag {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0[..]
    }
}

pub fn metric_tag(tag: impl Into<Cow<'static, str>>) -> MetricTag {
    MetricTag(tag.into())
}
pub fn metric_tag_const_value(key: &'static str, value: &'static str) -> MetricTag {
    MetricTag(format!("{key}:{value}").into())
}

impl MetricTag {
    pub const STATUS_CONFLICT: MetricTag = MetricTag(Cow::Borrowed("status:conflict"));
    pub const STATUS_ERROR: MetricTag = MetricTag(Cow::Borrowed("status:error"));
    pub const STATUS_SUCCESS: MetricTag = MetricTag(Cow::Borrowed("status:success"));

    pub fn status(is_ok: bool) -> MetricTag {
        if is_ok {
            Self::STATUS_SUCCESS
        } else {
            Self::STATUS_ERROR
        }
    }

    pub fn split_key_value(&self) -> (&str, &str) {
        self.0.split_once(':').unwrap_or((&self.0, "true"))
    }
}

pub const STATUS_LABEL: [&str; 1] = ["status"];

#[cfg(test)]
mod tests {
    use super::{
        metric_tag,
        metric_tag_const_value,
        MetricTag,
    };

    #[test]
    fn test_split_key_value() {
        assert_eq!(
            metric_tag_const_value("status", "conflict").split_key_value(),
            ("status", "conflict")
        );
        assert_eq!(metric_tag("prefetch").split_key_value(), ("prefetch", "true"));
        assert_eq!(MetricTag::status(false), MetricTag::STATUS_ERROR);
    }
}
